//! `newc` cpio archives, the initramfs format.
//!
//! The writer stamps every entry with mtime 0, uid/gid 0 and sequential
//! inode numbers so identical trees give identical archives. The reader
//! walks chained archives (TRAILER, zero padding, next archive) the way the
//! kernel does.

use anyhow::{bail, Context, Result};
use std::io::{self, Read, Write};

pub const NEWC_MAGIC: &[u8; 6] = b"070701";
pub const NEWC_HDR_LEN: usize = 110;
pub const TRAILER: &str = "TRAILER!!!";

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;

struct Header<'a> {
    ino: u32,
    mode: u32,
    nlink: u32,
    filesize: u32,
    rmajor: u32,
    rminor: u32,
    name: &'a str,
}

/// Streaming archive writer.
pub struct ArchiveWriter<W: Write> {
    writer: W,
    off: u64,
    ino: u32,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            off: 0,
            ino: 0,
        }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u64 {
        self.off
    }

    fn next_ino(&mut self) -> u32 {
        self.ino += 1;
        self.ino
    }

    fn write_header(&mut self, hdr: &Header<'_>) -> io::Result<()> {
        let namesize = hdr.name.len() + 1;
        let text = format!(
            "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            hdr.ino,
            hdr.mode,
            0, // uid
            0, // gid
            hdr.nlink,
            0, // mtime
            hdr.filesize,
            0, // dev major
            0, // dev minor
            hdr.rmajor,
            hdr.rminor,
            namesize,
            0, // checksum
        );
        debug_assert_eq!(text.len(), NEWC_HDR_LEN);
        self.writer.write_all(text.as_bytes())?;
        self.writer.write_all(hdr.name.as_bytes())?;
        self.writer.write_all(&[0])?;
        self.off += (NEWC_HDR_LEN + namesize) as u64;
        self.pad()
    }

    fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.off += data.len() as u64;
        self.pad()
    }

    fn pad(&mut self) -> io::Result<()> {
        let padding = ((4 - (self.off % 4)) % 4) as usize;
        self.writer.write_all(&[0u8; 3][..padding])?;
        self.off += padding as u64;
        Ok(())
    }

    pub fn add_dir(&mut self, name: &str, perm: u32) -> io::Result<()> {
        let ino = self.next_ino();
        self.write_header(&Header {
            ino,
            mode: S_IFDIR | (perm & 0o7777),
            nlink: 2,
            filesize: 0,
            rmajor: 0,
            rminor: 0,
            name,
        })
    }

    pub fn add_file(&mut self, name: &str, perm: u32, data: &[u8]) -> io::Result<()> {
        let filesize = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{} exceeds 4 GiB", name))
        })?;
        let ino = self.next_ino();
        self.write_header(&Header {
            ino,
            mode: S_IFREG | (perm & 0o7777),
            nlink: 1,
            filesize,
            rmajor: 0,
            rminor: 0,
            name,
        })?;
        self.write_data(data)
    }

    /// Add a regular file streamed from a reader of known length.
    pub fn add_file_from<R: Read>(
        &mut self,
        name: &str,
        perm: u32,
        len: u64,
        reader: &mut R,
    ) -> io::Result<()> {
        let filesize = u32::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{} exceeds 4 GiB", name))
        })?;
        let ino = self.next_ino();
        self.write_header(&Header {
            ino,
            mode: S_IFREG | (perm & 0o7777),
            nlink: 1,
            filesize,
            rmajor: 0,
            rminor: 0,
            name,
        })?;
        let copied = io::copy(&mut reader.take(len), &mut self.writer)?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while archiving", name),
            ));
        }
        self.off += len;
        self.pad()
    }

    pub fn add_symlink(&mut self, name: &str, target: &str) -> io::Result<()> {
        let ino = self.next_ino();
        self.write_header(&Header {
            ino,
            mode: S_IFLNK | 0o777,
            nlink: 1,
            filesize: target.len() as u32,
            rmajor: 0,
            rminor: 0,
            name,
        })?;
        self.write_data(target.as_bytes())
    }

    pub fn add_device(
        &mut self,
        name: &str,
        block: bool,
        major: u32,
        minor: u32,
        perm: u32,
    ) -> io::Result<()> {
        let kind = if block { S_IFBLK } else { S_IFCHR };
        let ino = self.next_ino();
        self.write_header(&Header {
            ino,
            mode: kind | (perm & 0o7777),
            nlink: 1,
            filesize: 0,
            rmajor: major,
            rminor: minor,
            name,
        })
    }

    /// Write the trailer and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_header(&Header {
            ino: 0,
            mode: 0,
            nlink: 1,
            filesize: 0,
            rmajor: 0,
            rminor: 0,
            name: TRAILER,
        })?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// One entry read back from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    pub name: String,
    pub mode: u32,
    pub rmajor: u32,
    pub rminor: u32,
    pub data: Vec<u8>,
}

impl CpioEntry {
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

fn hex_field(header: &[u8], index: usize) -> Result<u32> {
    let start = 6 + index * 8;
    let text = std::str::from_utf8(&header[start..start + 8]).context("Non-ASCII cpio header")?;
    u32::from_str_radix(text, 16).with_context(|| format!("Bad cpio header field '{}'", text))
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Parse every entry of one or more concatenated (uncompressed) archives.
///
/// Later entries with the same name shadow earlier ones, as on unpack.
pub fn read_entries(bytes: &[u8]) -> Result<Vec<CpioEntry>> {
    let mut entries: Vec<CpioEntry> = Vec::new();
    let mut pos = 0;

    loop {
        // Chained archives are separated by zero padding
        while pos < bytes.len() && bytes[pos] == 0 {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        if bytes.len() < pos + NEWC_HDR_LEN {
            bail!("Truncated cpio header at offset {}", pos);
        }
        let header = &bytes[pos..pos + NEWC_HDR_LEN];
        if &header[..6] != NEWC_MAGIC {
            bail!("Bad cpio magic at offset {}", pos);
        }

        let mode = hex_field(header, 1)?;
        let filesize = hex_field(header, 6)? as usize;
        let rmajor = hex_field(header, 9)?;
        let rminor = hex_field(header, 10)?;
        let namesize = hex_field(header, 11)? as usize;

        let name_start = pos + NEWC_HDR_LEN;
        let name_end = name_start + namesize;
        if namesize == 0 || bytes.len() < name_end {
            bail!("Truncated cpio name at offset {}", pos);
        }
        let name = String::from_utf8_lossy(&bytes[name_start..name_end - 1]).into_owned();

        let data_start = align4(name_end);
        let data_end = data_start + filesize;
        if bytes.len() < data_end {
            bail!("Truncated cpio data for '{}'", name);
        }
        pos = align4(data_end);

        if name == TRAILER {
            continue;
        }

        let entry = CpioEntry {
            mode,
            rmajor,
            rminor,
            data: bytes[data_start..data_end].to_vec(),
            name,
        };
        entries.retain(|e| e.name != entry.name);
        entries.push(entry);
    }

    Ok(entries)
}
