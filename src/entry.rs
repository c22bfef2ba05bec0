//! Format-agnostic description of one object inside a container.

use std::time::SystemTime;

use crate::path::NodePath;

/// The kind of object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Special,
}

impl EntryKind {
    pub fn is_file(self) -> bool {
        self == EntryKind::File
    }

    pub fn is_directory(self) -> bool {
        self == EntryKind::Directory
    }
}

/// Which size attribute of an entry is being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeKind {
    /// Logical size of the entry's content.
    Data,
    /// Size occupied in the backing container, e.g. after compression.
    Storage,
}

/// Which access attribute (timestamp or permission) is being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Create,
    Read,
    Write,
}

/// The principal class a permission bit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Principal {
    User,
    Group,
    Other,
}

const ACCESSES: [Access; 3] = [Access::Create, Access::Read, Access::Write];
const PRINCIPALS: [Principal; 3] = [Principal::User, Principal::Group, Principal::Other];

/// Permission bits keyed by (access × principal class).
///
/// Stored as a 9-bit matrix. Absent from an entry entirely when the backing
/// format carries no permission information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions(u16);

impl Permissions {
    fn bit(access: Access, principal: Principal) -> u16 {
        let a = ACCESSES.iter().position(|x| *x == access).unwrap();
        let p = PRINCIPALS.iter().position(|x| *x == principal).unwrap();
        1 << (a * 3 + p)
    }

    pub fn get(&self, access: Access, principal: Principal) -> bool {
        self.0 & Self::bit(access, principal) != 0
    }

    pub fn set(&mut self, access: Access, principal: Principal, allowed: bool) {
        let bit = Self::bit(access, principal);
        if allowed {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// All nine bits set.
    pub fn allow_all() -> Permissions {
        Permissions(0x1ff)
    }

    /// Map a POSIX mode's rwx triples onto the permission matrix. Creation
    /// inside a directory rides with its write bit.
    pub fn from_unix_mode(mode: u32) -> Permissions {
        let mut perms = Permissions::default();
        for (principal, shift) in [
            (Principal::User, 6),
            (Principal::Group, 3),
            (Principal::Other, 0),
        ] {
            let bits = mode >> shift;
            perms.set(Access::Read, principal, bits & 0b100 != 0);
            perms.set(Access::Write, principal, bits & 0b010 != 0);
            perms.set(Access::Create, principal, bits & 0b010 != 0);
        }
        perms
    }

    /// The reverse mapping. Directories regain an execute bit wherever they
    /// are readable.
    pub fn to_unix_mode(&self, directory: bool) -> u32 {
        let mut mode = 0u32;
        for (principal, shift) in [
            (Principal::User, 6),
            (Principal::Group, 3),
            (Principal::Other, 0),
        ] {
            if self.get(Access::Read, principal) {
                mode |= 0b100 << shift;
                if directory {
                    mode |= 0b001 << shift;
                }
            }
            if self.get(Access::Write, principal) {
                mode |= 0b010 << shift;
            }
        }
        mode
    }
}

/// One object inside a container: a file, directory, symlink or special
/// entry, with its sizes, timestamps and permissions.
///
/// Mutable while being assembled; once handed to a container it is treated
/// as committed and is only ever cloned, never modified in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: NodePath,
    pub kind: EntryKind,
    data_size: Option<u64>,
    storage_size: Option<u64>,
    create_time: Option<SystemTime>,
    read_time: Option<SystemTime>,
    write_time: Option<SystemTime>,
    pub permissions: Option<Permissions>,
}

impl Entry {
    pub fn new(path: NodePath, kind: EntryKind) -> Entry {
        Entry {
            path,
            kind,
            data_size: None,
            storage_size: None,
            create_time: None,
            read_time: None,
            write_time: None,
            permissions: None,
        }
    }

    pub fn file(path: NodePath) -> Entry {
        Entry::new(path, EntryKind::File)
    }

    pub fn directory(path: NodePath) -> Entry {
        Entry::new(path, EntryKind::Directory)
    }

    pub fn name(&self) -> &str {
        self.path.filename()
    }

    /// A size attribute, `None` while not yet known.
    pub fn size(&self, kind: SizeKind) -> Option<u64> {
        match kind {
            SizeKind::Data => self.data_size,
            SizeKind::Storage => self.storage_size,
        }
    }

    pub fn set_size(&mut self, kind: SizeKind, size: Option<u64>) {
        match kind {
            SizeKind::Data => self.data_size = size,
            SizeKind::Storage => self.storage_size = size,
        }
    }

    /// A timestamp attribute, `None` while not yet known.
    pub fn time(&self, access: Access) -> Option<SystemTime> {
        match access {
            Access::Create => self.create_time,
            Access::Read => self.read_time,
            Access::Write => self.write_time,
        }
    }

    pub fn set_time(&mut self, access: Access, time: Option<SystemTime>) {
        match access {
            Access::Create => self.create_time = time,
            Access::Read => self.read_time = time,
            Access::Write => self.write_time = time,
        }
    }

    /// Stamp the write (and, if unset, create) time with the current clock.
    pub fn touch(&mut self) {
        let now = SystemTime::now();
        if self.create_time.is_none() {
            self.create_time = Some(now);
        }
        self.write_time = Some(now);
    }

    /// Copy sizes, times and permissions from a template entry, keeping
    /// this entry's path and kind.
    pub fn apply_template(&mut self, template: &Entry) {
        self.data_size = template.data_size;
        self.storage_size = template.storage_size;
        self.create_time = template.create_time;
        self.read_time = template.read_time;
        self.write_time = template.write_time;
        self.permissions = template.permissions;
    }

    /// Whether the given access mode is permitted. Entries without
    /// permission information permit everything.
    pub fn is_permitted(&self, access: Access, principal: Principal) -> bool {
        match self.permissions {
            Some(p) => p.get(access, principal),
            None => true,
        }
    }
}
