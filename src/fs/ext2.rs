//! The ext2-style volume: superblock, block-group descriptors, bitmaps,
//! inode table and packed directory entries, all reached through the block
//! cache.
//!
//! Only direct block pointers are implemented; the indirect chains exist on
//! disk but anything past the direct span is refused. The on-disk records
//! match the source volume format: a 1 KiB-offset superblock whose magic
//! sits just after the inode size, standard 128-byte inodes, 32-byte group
//! descriptors and 4-byte-aligned directory records terminated by a zero
//! inode or record size.

use super::cache::BlockCache;
use super::device::{DeviceStatus, SectorDevice};
use alloc::vec;
use alloc::vec::Vec;
use bitvec::prelude::{BitVec, Lsb0};
use core::mem;

/// Byte offset of the superblock from the start of the volume
const SUPERBLOCK_OFFSET: u64 = 1024;
/// The superblock signature
const EXT2_MAGIC: u16 = 0xEF53;
/// The root directory's inode number
pub const ROOT_INODE: u32 = 2;
/// Direct block pointers per inode
pub const DIRECT_POINTERS: usize = 12;

/// Type nibble of a regular file
const TYPE_FILE: u16 = 0x8000;
/// Type nibble of a directory
const TYPE_DIRECTORY: u16 = 0x4000;
/// Type nibble of a symbolic link
const TYPE_SYMLINK: u16 = 0xA000;
/// Permission bits stamped onto new inodes (owner read/write)
const NEW_INODE_PERMISSIONS: u16 = 0x180;

/// Why a volume operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Ext2Error {
    /// No directory entry matched
    #[display(fmt = "entry not found")]
    NotFound,
    /// The name is already taken
    #[display(fmt = "entry already exists")]
    Exists,
    /// A directory operation hit a non-directory
    #[display(fmt = "not a directory")]
    NotADirectory,
    /// A file operation hit a non-file
    #[display(fmt = "not a file")]
    NotAFile,
    /// The inode or block bitmaps are exhausted
    #[display(fmt = "no space left on volume")]
    NoSpace,
    /// The operation would need indirect blocks
    #[display(fmt = "file exceeds the direct-block span")]
    TooLarge,
    /// The device underneath failed
    #[display(fmt = "device fault: {}", _0)]
    Device(DeviceStatus),
}

impl From<DeviceStatus> for Ext2Error {
    fn from(status: DeviceStatus) -> Self {
        Self::Device(status)
    }
}

/// The on-disk superblock, reduced to the fields the kernel reads
#[repr(C)]
struct RawSuperblock {
    /// Total inodes in the filesystem
    inode_count: u32,
    /// Total blocks in the filesystem
    block_count: u32,
    _pad0: [u8; 16],
    /// Block size as a power of two over 1024
    block_size_exponent: u32,
    _pad1: [u8; 4],
    /// Blocks per block group
    blocks_per_group: u32,
    _pad2: [u8; 4],
    /// Inodes per block group
    inodes_per_group: u32,
    _pad3: [u8; 44],
    /// Bytes per inode record
    inode_size: u16,
    /// Must equal `EXT2_MAGIC`
    magic: u16,
}

/// One on-disk block-group descriptor
#[repr(C)]
struct RawGroupDescriptor {
    /// Block holding the block bitmap
    block_bitmap: u32,
    /// Block holding the inode bitmap
    inode_bitmap: u32,
    /// First block of the inode table
    inode_table: u32,
    /// Unallocated blocks in this group
    free_blocks: u16,
    /// Unallocated inodes in this group
    free_inodes: u16,
    /// Directories in this group
    used_directories: u16,
    _pad: [u8; 14],
}

/// The on-disk inode record
#[repr(C)]
#[derive(Clone)]
struct RawInode {
    /// Type in the top nibble, permissions below
    type_and_permissions: u16,
    _pad0: [u8; 2],
    /// Size in bytes
    size: u32,
    _pad1: [u8; 18],
    /// Hard links referencing this inode
    hard_links: u16,
    _pad2: [u8; 12],
    /// The direct data-block pointers; zero means a hole
    direct: [u32; DIRECT_POINTERS],
    /// Unimplemented indirection chains
    single_indirect: u32,
    double_indirect: u32,
    triple_indirect: u32,
    _pad3: [u8; 28],
}

/// An inode pulled into memory, remembering its own number
#[derive(Clone)]
pub struct Inode {
    /// The 1-based inode number
    pub number: u32,
    /// The raw on-disk record
    raw: RawInode,
}

impl Inode {
    /// The type nibble of the mode field
    fn node_type(&self) -> u16 {
        self.raw.type_and_permissions & 0xF000
    }

    /// Whether this is a directory
    pub fn is_dir(&self) -> bool {
        self.node_type() == TYPE_DIRECTORY
    }

    /// Whether this is a regular file
    pub fn is_file(&self) -> bool {
        self.node_type() == TYPE_FILE
    }

    /// Whether this is a symbolic link
    pub fn is_symlink(&self) -> bool {
        self.node_type() == TYPE_SYMLINK
    }

    /// Size of the underlying object, in bytes
    pub fn size(&self) -> u32 {
        self.raw.size
    }
}

/// A directory entry surfaced to callers
pub struct DirEntry {
    /// The inode the entry points at
    pub inode: u32,
    /// The stored name bytes (not null-terminated on disk)
    pub name: Vec<u8>,
}

/// Which cached metadata is newer than the device copy
#[derive(Default)]
struct DirtyFlags {
    /// The cached inode bitmap was modified
    inode_bitmap: bool,
    /// The cached block bitmap was modified
    block_bitmap: bool,
    /// The group descriptor was modified
    bgdt: bool,
}

/// A mounted volume
pub struct Ext2<D: SectorDevice> {
    /// The caching block view of the device
    cache: BlockCache<D>,
    /// Total inodes
    inode_count: u32,
    /// Total blocks
    block_count: u32,
    /// Inodes per block group
    inodes_per_group: u32,
    /// Bytes per inode record
    inode_size: u32,
    /// Block index of the group descriptor table
    bgdt_block: u32,
    /// Group 0's descriptor
    bgdt: RawGroupDescriptor,
    /// In-memory copy of the block bitmap
    block_bitmap: BitVec<u8, Lsb0>,
    /// In-memory copy of the inode bitmap
    inode_bitmap: BitVec<u8, Lsb0>,
    /// Pending metadata write-backs
    dirty: DirtyFlags,
}

/// Reads a `T` out of the volume at the given byte offset
///
/// # Safety
///
/// `T` must tolerate arbitrary byte patterns in every field
unsafe fn read_record<T, D: SectorDevice>(
    cache: &mut BlockCache<D>,
    offset: u64,
) -> Result<T, DeviceStatus> {
    let mut value = mem::MaybeUninit::<T>::uninit();
    // SAFETY: The slice covers exactly the uninitialized record, which
    // `read_all` fills completely before `assume_init`
    unsafe {
        let bytes =
            core::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), mem::size_of::<T>());
        cache.read_all(offset, bytes)?;
        Ok(value.assume_init())
    }
}

/// Writes a `T` back to the volume at the given byte offset
fn write_record<T, D: SectorDevice>(
    cache: &mut BlockCache<D>,
    offset: u64,
    value: &T,
) -> Result<(), DeviceStatus> {
    // SAFETY: Any initialized value can be viewed as bytes
    let bytes = unsafe {
        core::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>())
    };
    cache.write_all(offset, bytes)
}

impl<D: SectorDevice> Ext2<D> {
    /// Mounts the volume on `device`: reads the superblock, the group
    /// descriptor table and both bitmaps, and derives the block size.
    ///
    /// # Panics
    ///
    /// Panics on a magic mismatch; an unrecognizable volume is a structural
    /// violation, not a recoverable error.
    pub fn mount(device: D) -> Result<Self, Ext2Error> {
        // The superblock must be read before the true block size is known
        let mut cache = BlockCache::new(device, SUPERBLOCK_OFFSET as usize);
        // SAFETY: Every superblock field tolerates arbitrary bytes
        let superblock: RawSuperblock = unsafe { read_record(&mut cache, SUPERBLOCK_OFFSET)? };

        assert_eq!(
            superblock.magic, EXT2_MAGIC,
            "The volume does not carry an ext2 signature"
        );

        let block_size = 1024_usize << superblock.block_size_exponent;
        if block_size != cache.block_size() {
            cache = BlockCache::new(cache.into_device()?, block_size);
        }

        // For 1 KiB blocks the superblock occupies block 1, so the
        // descriptor table starts at block 2; larger blocks absorb the
        // superblock into block 0
        let bgdt_block = if block_size == 1024 { 2 } else { 1 };
        // SAFETY: Every descriptor field tolerates arbitrary bytes
        let bgdt: RawGroupDescriptor =
            unsafe { read_record(&mut cache, bgdt_block as u64 * block_size as u64)? };

        let mut block_bitmap_bytes = vec![0; block_size];
        cache.read_block(bgdt.block_bitmap, &mut block_bitmap_bytes)?;
        let mut inode_bitmap_bytes = vec![0; block_size];
        cache.read_block(bgdt.inode_bitmap, &mut inode_bitmap_bytes)?;

        Ok(Self {
            cache,
            inode_count: superblock.inode_count,
            block_count: superblock.block_count,
            inodes_per_group: superblock.inodes_per_group,
            inode_size: u32::from(superblock.inode_size),
            bgdt_block,
            bgdt,
            block_bitmap: BitVec::from_vec(block_bitmap_bytes),
            inode_bitmap: BitVec::from_vec(inode_bitmap_bytes),
            dirty: DirtyFlags::default(),
        })
    }

    /// The volume's block size, in bytes
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// Free counts as the group descriptor records them, for consistency
    /// checks
    pub fn free_counts(&self) -> (u16, u16) {
        (self.bgdt.free_blocks, self.bgdt.free_inodes)
    }

    /// Bits set in the cached (block, inode) bitmaps, for consistency checks
    pub fn bitmap_populations(&self) -> (usize, usize) {
        (
            self.block_bitmap[..self.block_count as usize].count_ones(),
            self.inode_bitmap[..self.inodes_per_group as usize].count_ones(),
        )
    }

    /// Byte offset of the on-disk record for inode `number`
    fn inode_offset(&self, number: u32) -> u64 {
        let index = (number - 1) % self.inodes_per_group;
        u64::from(self.bgdt.inode_table) * self.block_size() as u64
            + u64::from(index) * u64::from(self.inode_size)
    }

    /// Loads inode `number` from the inode table
    pub fn read_inode(&mut self, number: u32) -> Result<Inode, Ext2Error> {
        assert!(number >= 1 && number <= self.inode_count, "Inode numbers are 1-based");
        let offset = self.inode_offset(number);
        // SAFETY: Every inode field tolerates arbitrary bytes
        let raw = unsafe { read_record(&mut self.cache, offset)? };
        Ok(Inode { number, raw })
    }

    /// Writes `inode` back to the inode table
    fn write_inode(&mut self, inode: &Inode) -> Result<(), Ext2Error> {
        let offset = self.inode_offset(inode.number);
        write_record(&mut self.cache, offset, &inode.raw)?;
        Ok(())
    }

    /// Reads the `logical`th block of `inode` into `buffer`.
    ///
    /// A zero direct pointer is a hole and reads as zeros. Blocks past the
    /// direct span are refused.
    pub fn read_block_of(
        &mut self,
        inode: &Inode,
        logical: usize,
        buffer: &mut [u8],
    ) -> Result<(), Ext2Error> {
        if logical >= DIRECT_POINTERS {
            return Err(Ext2Error::TooLarge);
        }
        let pointer = inode.raw.direct[logical];
        if pointer == 0 {
            buffer[..self.block_size()].fill(0);
            return Ok(());
        }
        self.cache.read_block(pointer, buffer)?;
        Ok(())
    }

    /// Reads the file body from offset 0, up to `buffer.len()` bytes,
    /// returning how many bytes came from the file. Only the direct span is
    /// readable; holes are zero-filled.
    pub fn read_file(&mut self, inode: &Inode, buffer: &mut [u8]) -> Result<usize, Ext2Error> {
        let block_size = self.block_size();
        let wanted = usize::min(inode.size() as usize, buffer.len());
        let readable = usize::min(wanted, DIRECT_POINTERS * block_size);

        let mut block = vec![0; block_size];
        let mut transferred = 0_usize;
        while transferred < readable {
            let chunk = usize::min(block_size, readable - transferred);
            self.read_block_of(inode, transferred / block_size, &mut block)?;
            buffer[transferred..transferred + chunk].copy_from_slice(&block[..chunk]);
            transferred += chunk;
        }
        Ok(transferred)
    }

    /// Buffers the whole file body. Files extending past the direct span are
    /// refused rather than silently truncated.
    pub fn read_to_vec(&mut self, inode: &Inode) -> Result<Vec<u8>, Ext2Error> {
        if inode.size() as usize > DIRECT_POINTERS * self.block_size() {
            return Err(Ext2Error::TooLarge);
        }
        let mut data = vec![0; inode.size() as usize];
        self.read_file(inode, &mut data)?;
        Ok(data)
    }

    /// Walks the packed entries of one directory block, calling `visit` for
    /// each until it returns `Some`. The walk ends early at a zero inode or
    /// record size.
    fn scan_directory<R>(
        &mut self,
        dir: &Inode,
        mut visit: impl FnMut(u32, &[u8]) -> Option<R>,
    ) -> Result<Option<R>, Ext2Error> {
        if !dir.is_dir() {
            return Err(Ext2Error::NotADirectory);
        }
        let block_size = self.block_size();
        let mut block = vec![0; block_size];
        let mut scanned = 0_usize;
        let mut logical = 0_usize;

        while scanned < dir.size() as usize && logical < DIRECT_POINTERS {
            self.read_block_of(dir, logical, &mut block)?;
            let mut offset = 0_usize;
            while offset + 8 <= block_size {
                let inode = u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap());
                let record_size =
                    u16::from_le_bytes(block[offset + 4..offset + 6].try_into().unwrap()) as usize;
                if inode == 0 || record_size == 0 {
                    break;
                }
                let name_len = usize::min(block[offset + 6] as usize, block_size - offset - 8);
                let name = &block[offset + 8..offset + 8 + name_len];
                if let Some(result) = visit(inode, name) {
                    return Ok(Some(result));
                }
                scanned += record_size;
                offset += record_size;
            }
            logical += 1;
        }
        Ok(None)
    }

    /// Finds the entry named `name` in `dir` and loads its inode
    pub fn find_in_directory(&mut self, dir: &Inode, name: &str) -> Result<Inode, Ext2Error> {
        let found = self.scan_directory(dir, |inode, entry_name| {
            (entry_name == name.as_bytes()).then_some(inode)
        })?;
        match found {
            Some(number) => self.read_inode(number),
            None => Err(Ext2Error::NotFound),
        }
    }

    /// Lists a directory's entries
    pub fn entries(&mut self, dir: &Inode) -> Result<Vec<DirEntry>, Ext2Error> {
        let mut listing = Vec::new();
        self.scan_directory(dir, |inode, name| {
            listing.push(DirEntry {
                inode,
                name: name.to_vec(),
            });
            None::<()>
        })?;
        Ok(listing)
    }

    /// Resolves a root-relative path ("/bin/init" or "init") component by
    /// component
    pub fn lookup_path(&mut self, path: &str) -> Result<Inode, Ext2Error> {
        let mut current = self.read_inode(ROOT_INODE)?;
        for component in path.split('/').filter(|part| !part.is_empty()) {
            current = self.find_in_directory(&current, component)?;
        }
        Ok(current)
    }

    /// Claims the first free inode in the directory's block group. Marks the
    /// bitmap and descriptor dirty; returns `None` when the group is full.
    fn allocate_inode(&mut self, dir: &Inode) -> Option<u32> {
        let group = (dir.number - 1) / self.inodes_per_group;
        let limit = self.inodes_per_group as usize;
        let index = self.inode_bitmap[..limit].first_zero()?;
        self.inode_bitmap.set(index, true);
        self.dirty.inode_bitmap = true;
        self.dirty.bgdt = true;
        self.bgdt.free_inodes -= 1;
        Some(group * self.inodes_per_group + index as u32 + 1)
    }

    /// Claims the first free block, marking the bitmap and descriptor dirty.
    /// Returns the 1-based block number, or zero when the volume is full.
    fn allocate_block(&mut self) -> u32 {
        let limit = self.block_count as usize;
        let Some(index) = self.block_bitmap[..limit].first_zero() else {
            return 0;
        };
        self.block_bitmap.set(index, true);
        self.dirty.block_bitmap = true;
        self.dirty.bgdt = true;
        self.bgdt.free_blocks -= 1;
        index as u32 + 1
    }

    /// Releases an inode claimed by `allocate_inode` during a failed
    /// multi-step operation, so no directory entry can ever point at an
    /// unclaimed inode
    fn rollback_inode(&mut self, number: u32) {
        let index = ((number - 1) % self.inodes_per_group) as usize;
        self.inode_bitmap.set(index, false);
        self.bgdt.free_inodes += 1;
        self.dirty.inode_bitmap = true;
        self.dirty.bgdt = true;
    }

    /// Initializes a fresh on-disk inode record of the given type
    fn create_inode(&mut self, number: u32, node_type: u16) -> Result<(), Ext2Error> {
        // SAFETY: An all-zero pattern is a valid `RawInode`
        let mut raw: RawInode = unsafe { mem::zeroed() };
        raw.type_and_permissions = node_type | NEW_INODE_PERMISSIONS;
        raw.hard_links = 1;
        self.write_inode(&Inode { number, raw })
    }

    /// Adds a directory entry for `name` to `dir`: the first unused slot in
    /// an existing block, or the start of a freshly allocated one. Returns
    /// whether the parent inode itself now needs writing back.
    fn add_dir_entry(
        &mut self,
        dir: &mut Inode,
        name: &str,
        inode_number: u32,
    ) -> Result<bool, Ext2Error> {
        let block_size = self.block_size();
        let name_len = name.len();
        // Header plus name, rounded up to the 4-byte record alignment
        let entry_size = (8 + name_len).div_ceil(4) * 4;
        let mut dir_dirty = false;

        let mut block = vec![0; block_size];
        let mut placement = None;
        for logical in 0..DIRECT_POINTERS {
            if dir.raw.direct[logical] == 0 {
                let fresh = self.allocate_block();
                if fresh == 0 {
                    return Err(Ext2Error::NoSpace);
                }
                dir.raw.direct[logical] = fresh;
                dir_dirty = true;
                block.fill(0);
                placement = Some((logical, 0));
                break;
            }

            self.read_block_of(dir, logical, &mut block)?;
            let mut offset = 0_usize;
            while offset + 8 <= block_size {
                let inode = u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap());
                let record_size =
                    u16::from_le_bytes(block[offset + 4..offset + 6].try_into().unwrap()) as usize;
                if inode == 0 || record_size == 0 {
                    break;
                }
                offset += record_size;
            }
            if offset + entry_size <= block_size {
                placement = Some((logical, offset));
                break;
            }
        }

        let Some((logical, offset)) = placement else {
            return Err(Ext2Error::NoSpace);
        };

        block[offset..offset + 4].copy_from_slice(&inode_number.to_le_bytes());
        block[offset + 4..offset + 6].copy_from_slice(&(entry_size as u16).to_le_bytes());
        block[offset + 6] = name_len as u8;
        block[offset + 7] = 1; // regular file
        block[offset + 8..offset + 8 + name_len].copy_from_slice(name.as_bytes());

        self.cache
            .write_block(dir.raw.direct[logical], &block, 0, block_size)?;

        let end_position = (logical * block_size + offset + entry_size) as u32;
        if end_position > dir.raw.size {
            dir.raw.size = end_position;
            dir_dirty = true;
        }
        Ok(dir_dirty)
    }

    /// Writes the cached metadata out in the crash-safe order: inode bitmap,
    /// block bitmap, group descriptor, then the parent inode. Interrupting
    /// the sequence after step N can never leave a directory entry pointing
    /// at an inode whose bitmap bit is still clear.
    fn flush_metadata(&mut self, parent: Option<&Inode>) -> Result<(), Ext2Error> {
        let block_size = self.block_size();
        if self.dirty.inode_bitmap {
            let bytes = self.inode_bitmap.clone().into_vec();
            self.cache
                .write_block(self.bgdt.inode_bitmap, &bytes, 0, block_size)?;
            self.dirty.inode_bitmap = false;
        }
        if self.dirty.block_bitmap {
            let bytes = self.block_bitmap.clone().into_vec();
            self.cache
                .write_block(self.bgdt.block_bitmap, &bytes, 0, block_size)?;
            self.dirty.block_bitmap = false;
        }
        if self.dirty.bgdt {
            let offset = u64::from(self.bgdt_block) * block_size as u64;
            write_record(&mut self.cache, offset, &self.bgdt)?;
            self.dirty.bgdt = false;
        }
        if let Some(inode) = parent {
            self.write_inode(inode)?;
        }
        self.cache.flush_cache()?;
        Ok(())
    }

    /// Creates an empty regular file named `name` under `dir`.
    ///
    /// Allocation is all-or-nothing: if the directory entry cannot be added,
    /// the freshly claimed inode is released before the error surfaces.
    pub fn create_file(&mut self, dir: &Inode, name: &str) -> Result<Inode, Ext2Error> {
        if !dir.is_dir() {
            return Err(Ext2Error::NotADirectory);
        }
        match self.find_in_directory(dir, name) {
            Ok(_) => return Err(Ext2Error::Exists),
            Err(Ext2Error::NotFound) => {}
            Err(err) => return Err(err),
        }

        let inode_number = self.allocate_inode(dir).ok_or(Ext2Error::NoSpace)?;
        self.create_inode(inode_number, TYPE_FILE)?;

        let mut parent = dir.clone();
        match self.add_dir_entry(&mut parent, name, inode_number) {
            Ok(parent_dirty) => {
                self.flush_metadata(parent_dirty.then_some(&parent))?;
                self.read_inode(inode_number)
            }
            Err(err) => {
                self.rollback_inode(inode_number);
                self.flush_metadata(None)?;
                Err(err)
            }
        }
    }

    /// Appends `data` to the end of `file`, growing it block by block within
    /// the direct span
    pub fn write_file(&mut self, file: &mut Inode, data: &[u8]) -> Result<usize, Ext2Error> {
        if !file.is_file() {
            return Err(Ext2Error::NotAFile);
        }
        let block_size = self.block_size();
        let mut written = 0_usize;
        while written < data.len() {
            let position = file.raw.size as usize;
            if position >= DIRECT_POINTERS * block_size {
                break;
            }
            let logical = position / block_size;
            let within = position % block_size;
            let chunk = usize::min(block_size - within, data.len() - written);

            if file.raw.direct[logical] == 0 {
                let fresh = self.allocate_block();
                if fresh == 0 {
                    break;
                }
                file.raw.direct[logical] = fresh;
            }
            self.cache
                .write_block(file.raw.direct[logical], &data[written..written + chunk], within, chunk)?;

            file.raw.size += chunk as u32;
            written += chunk;
        }
        self.write_inode(file)?;
        self.flush_metadata(None)?;
        if written == 0 && !data.is_empty() {
            return Err(Ext2Error::NoSpace);
        }
        Ok(written)
    }

    /// Writes all dirty state out to the device
    pub fn sync(&mut self) -> Result<(), Ext2Error> {
        self.flush_metadata(None)?;
        Ok(())
    }

    /// Flushes everything and returns the underlying device
    pub fn into_device(mut self) -> Result<D, Ext2Error> {
        self.flush_metadata(None)?;
        Ok(self.cache.into_device()?)
    }
}
