//! Typed view over a mutable 64-bit Mach-O image, plus the in-place
//! load-command editor.
//!
//! Every field access is an endian-aware load out of the byte buffer; the
//! only writer is [`MachFile::append_load_command`], which confines itself to
//! the header's `ncmds`/`sizeofcmds` fields and the zeroed reserve between
//! the load-command area and the first segment's contents.

use goblin::container::Ctx;
use goblin::mach::header::{Header, MH_MAGIC_64, SIZEOF_HEADER_64};
use goblin::mach::parse_magic_and_ctx;
use goblin::mach::load_command::{
    DyldInfoCommand, Dylib, DylibCommand, LC_DYLD_INFO_ONLY, LC_LOAD_DYLIB, LC_LOAD_DYLINKER,
    LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_SEGMENT_64, SegmentCommand64,
};
use scroll::{LE, Pread, Pwrite};

use crate::errors::{PatchError, Result};

/// Fixed prefix of a `dylib_command` on disk: `cmd`, `cmdsize`, and the four
/// `struct dylib` fields.
const DYLIB_COMMAND_PREFIX: usize = 24;

/// A load command record as it sits in the file.
#[derive(Debug, Clone, Copy)]
pub struct RawCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub offset: usize,
}

/// `LC_LOAD_DYLIB`-family commands that occupy a slot in the dylib ordinal
/// space (the dylinker is handled separately as ordinal 0).
fn is_dylib_load(cmd: u32) -> bool {
    matches!(cmd, LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_LOAD_UPWARD_DYLIB)
}

pub struct MachFile<'a> {
    data: &'a mut [u8],
    header: Header,
    ctx: Ctx,
}

impl<'a> MachFile<'a> {
    /// Accept a 64-bit little-endian Mach-O and nothing else: 32-bit and fat
    /// magics (byte-swapped or not), and buffers too short for a full
    /// header, all land in `UnsupportedImage`.
    pub fn parse(data: &'a mut [u8]) -> Result<Self> {
        let (magic, maybe_ctx) = match parse_magic_and_ctx(data, 0) {
            Ok(parsed) => parsed,
            Err(_) => return Err(PatchError::UnsupportedImage(0)),
        };
        if magic != MH_MAGIC_64 || data.len() < SIZEOF_HEADER_64 {
            return Err(PatchError::UnsupportedImage(magic));
        }
        let ctx = maybe_ctx.ok_or(PatchError::UnsupportedImage(magic))?;
        let header: Header = data.pread_with(0, ctx)?;
        Ok(MachFile { data, header, ctx })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn bytes(&self) -> &[u8] {
        self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// Walk the load-command area: exactly `ncmds` records starting right
    /// after the fixed header, each advancing by its own `cmdsize`.
    pub fn load_commands(&self) -> Result<Vec<RawCommand>> {
        let end = SIZEOF_HEADER_64 + self.header.sizeofcmds as usize;
        if end > self.data.len() {
            return Err(PatchError::MalformedImage(
                "sizeofcmds extends past the end of the file",
            ));
        }
        let ncmds = self.header.ncmds as u32;
        let mut commands = Vec::with_capacity(ncmds as usize);
        let mut offset = SIZEOF_HEADER_64;
        for index in 0..ncmds {
            if offset + 8 > end {
                return Err(PatchError::TruncatedCommands { index });
            }
            let cmd: u32 = self.data.pread_with(offset, LE)?;
            let cmdsize: u32 = self.data.pread_with(offset + 4, LE)?;
            if cmdsize < 8 || cmdsize % 8 != 0 {
                return Err(PatchError::MalformedImage(
                    "load command size must be a nonzero multiple of 8",
                ));
            }
            if offset + cmdsize as usize > end {
                return Err(PatchError::TruncatedCommands { index });
            }
            commands.push(RawCommand {
                cmd,
                cmdsize,
                offset,
            });
            offset += cmdsize as usize;
        }
        Ok(commands)
    }

    /// First load command matching `pred`.
    pub fn find_load_command(
        &self,
        mut pred: impl FnMut(&RawCommand) -> bool,
    ) -> Result<Option<RawCommand>> {
        Ok(self.load_commands()?.into_iter().find(|rc| pred(rc)))
    }

    fn segments(&self) -> Result<Vec<SegmentCommand64>> {
        let mut segments = Vec::new();
        for rc in self.load_commands()? {
            if rc.cmd == LC_SEGMENT_64 {
                segments.push(self.data.pread_with::<SegmentCommand64>(rc.offset, LE)?);
            }
        }
        Ok(segments)
    }

    /// First `LC_SEGMENT_64` whose NUL-padded 16-byte name equals `name`.
    pub fn find_segment(&self, name: &str) -> Result<Option<SegmentCommand64>> {
        Ok(self
            .segments()?
            .into_iter()
            .find(|segment| segment_name(segment) == name.as_bytes()))
    }

    /// Smallest nonzero segment file offset. The load-command reserve ends
    /// where the first segment's contents begin.
    pub fn first_segment_fileoff(&self) -> Result<Option<u64>> {
        Ok(self
            .segments()?
            .iter()
            .map(|segment| segment.fileoff)
            .filter(|fileoff| *fileoff > 0)
            .min())
    }

    /// The unique `LC_DYLD_INFO_ONLY` command.
    pub fn dyld_info(&self) -> Result<DyldInfoCommand> {
        let mut found = None;
        for rc in self.load_commands()? {
            if rc.cmd == LC_DYLD_INFO_ONLY {
                if found.is_some() {
                    return Err(PatchError::MalformedImage(
                        "more than one LC_DYLD_INFO_ONLY",
                    ));
                }
                found = Some(self.data.pread_with::<DyldInfoCommand>(rc.offset, LE)?);
            }
        }
        found.ok_or(PatchError::MissingDyldInfo)
    }

    /// Path string of a dylib-bearing command. The `lc_str` offset field sits
    /// at byte 8 for the `LC_LOAD_DYLIB` family and `LC_LOAD_DYLINKER` alike.
    pub fn command_name(&self, rc: &RawCommand) -> Result<&[u8]> {
        let name_off: u32 = self.data.pread_with(rc.offset + 8, LE)?;
        if name_off < 8 || name_off >= rc.cmdsize {
            return Err(PatchError::MalformedImage(
                "lc_str offset outside its load command",
            ));
        }
        let start = rc.offset + name_off as usize;
        let end = rc.offset + rc.cmdsize as usize;
        let bytes = &self.data[start..end];
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(&bytes[..len])
    }

    /// Ordinal of the load command whose path equals `install_name`, if any.
    ///
    /// The ordinal space assigns 0 to `LC_LOAD_DYLINKER` and counts dylib
    /// commands from 1 in file order, matching the 1-based ordinals the bind
    /// stream encodes.
    pub fn dylib_ordinal(&self, install_name: &str) -> Result<Option<u64>> {
        let mut next = 1u64;
        for rc in self.load_commands()? {
            let ordinal = match rc.cmd {
                LC_LOAD_DYLINKER => 0,
                cmd if is_dylib_load(cmd) => {
                    let ordinal = next;
                    next += 1;
                    ordinal
                }
                _ => continue,
            };
            if self.command_name(&rc)? == install_name.as_bytes() {
                return Ok(Some(ordinal));
            }
        }
        Ok(None)
    }

    /// Append a fully built load command into the zero reserve between the
    /// load-command area and the first segment's contents, then bump `ncmds`
    /// and `sizeofcmds`.
    ///
    /// On failure nothing is written.
    pub fn append_load_command(&mut self, block: &[u8]) -> Result<()> {
        let cmdsize: u32 = block.pread_with(4, LE)?;
        if cmdsize as usize != block.len() || block.len() % 8 != 0 {
            return Err(PatchError::MalformedImage(
                "new load command must declare its own 8-aligned length",
            ));
        }
        let gap_start = SIZEOF_HEADER_64 + self.header.sizeofcmds as usize;
        let gap_end = self
            .first_segment_fileoff()?
            .map_or(self.data.len(), |fileoff| {
                (fileoff as usize).min(self.data.len())
            });
        let available = gap_end.saturating_sub(gap_start);
        if available < block.len() {
            return Err(PatchError::InsufficientHeaderSpace {
                needed: block.len(),
                available,
            });
        }
        let reserve = &mut self.data[gap_start..gap_start + block.len()];
        if reserve.iter().any(|b| *b != 0) {
            return Err(PatchError::HeaderNotZeroPadded(gap_start));
        }
        reserve.copy_from_slice(block);
        self.header.ncmds += 1;
        self.header.sizeofcmds += block.len() as u32;
        self.data.pwrite_with(self.header, 0, self.ctx)?;
        Ok(())
    }
}

fn segment_name(segment: &SegmentCommand64) -> &[u8] {
    let name = &segment.segname[..];
    let len = name.iter().position(|b| *b == 0).unwrap_or(name.len());
    &name[..len]
}

/// Serialize an `LC_LOAD_DYLIB` for `install_name`: 24-byte fixed prefix,
/// NUL-terminated path, zero padding up to an 8-byte multiple.
pub fn build_dylib_command(install_name: &str) -> Result<Vec<u8>> {
    let cmdsize = (DYLIB_COMMAND_PREFIX + install_name.len() + 1).next_multiple_of(8);
    let command = DylibCommand {
        cmd: LC_LOAD_DYLIB,
        cmdsize: cmdsize as u32,
        dylib: Dylib {
            name: DYLIB_COMMAND_PREFIX as u32,
            timestamp: 2,
            current_version: 1,
            compatibility_version: 1,
        },
    };
    let mut block = vec![0u8; cmdsize];
    block.pwrite_with(command, 0, LE)?;
    block[DYLIB_COMMAND_PREFIX..DYLIB_COMMAND_PREFIX + install_name.len()]
        .copy_from_slice(install_name.as_bytes());
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, value: u64) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn dylinker_command(path: &str) -> Vec<u8> {
        let cmdsize = (12 + path.len() + 1).next_multiple_of(8);
        let mut cmd = Vec::new();
        push_u32(&mut cmd, LC_LOAD_DYLINKER);
        push_u32(&mut cmd, cmdsize as u32);
        push_u32(&mut cmd, 12);
        cmd.extend_from_slice(path.as_bytes());
        cmd.resize(cmdsize, 0);
        cmd
    }

    fn segment_command(name: &str, fileoff: u64, filesize: u64) -> Vec<u8> {
        let mut cmd = Vec::new();
        push_u32(&mut cmd, LC_SEGMENT_64);
        push_u32(&mut cmd, 72);
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name.as_bytes());
        cmd.extend_from_slice(&segname);
        push_u64(&mut cmd, 0x1_0000_0000);
        push_u64(&mut cmd, filesize);
        push_u64(&mut cmd, fileoff);
        push_u64(&mut cmd, filesize);
        push_u32(&mut cmd, 5);
        push_u32(&mut cmd, 5);
        push_u32(&mut cmd, 0);
        push_u32(&mut cmd, 0);
        cmd
    }

    /// Header + dylinker + the given dylibs + one `__TEXT` segment whose
    /// contents begin `reserve` bytes after the load-command area.
    fn build_image(dylibs: &[&str], reserve: usize) -> Vec<u8> {
        let dylinker = dylinker_command("/usr/lib/dyld");
        let dylib_cmds: Vec<Vec<u8>> = dylibs
            .iter()
            .map(|name| build_dylib_command(name).unwrap())
            .collect();
        let sizeofcmds = 72 + dylinker.len() + dylib_cmds.iter().map(Vec::len).sum::<usize>();
        let fileoff = SIZEOF_HEADER_64 + sizeofcmds + reserve;
        let file_len = fileoff + 64;

        let mut image = Vec::new();
        push_u32(&mut image, MH_MAGIC_64);
        push_u32(&mut image, 0x0100_000c);
        push_u32(&mut image, 0);
        push_u32(&mut image, 2);
        push_u32(&mut image, (2 + dylib_cmds.len()) as u32);
        push_u32(&mut image, sizeofcmds as u32);
        push_u32(&mut image, 0);
        push_u32(&mut image, 0);
        image.extend_from_slice(&segment_command("__TEXT", fileoff as u64, 64));
        image.extend_from_slice(&dylinker);
        for cmd in &dylib_cmds {
            image.extend_from_slice(cmd);
        }
        image.resize(fileoff, 0);
        image.resize(file_len, 0xcc);
        image
    }

    #[test]
    fn rejects_foreign_magics() {
        for bytes in [
            0xcafe_babeu32.to_be_bytes(), // FAT_MAGIC on disk
            0xfeed_faceu32.to_le_bytes(), // 32-bit
            0xfeed_facfu32.to_be_bytes(), // byte-swapped 64-bit
        ] {
            let mut image = bytes.to_vec();
            image.resize(64, 0);
            assert!(matches!(
                MachFile::parse(&mut image),
                Err(PatchError::UnsupportedImage(_))
            ));
        }
        let mut empty = Vec::new();
        assert!(matches!(
            MachFile::parse(&mut empty),
            Err(PatchError::UnsupportedImage(0))
        ));
        // Right magic, but the buffer stops short of a full header.
        let mut truncated = MH_MAGIC_64.to_le_bytes().to_vec();
        assert!(matches!(
            MachFile::parse(&mut truncated),
            Err(PatchError::UnsupportedImage(MH_MAGIC_64))
        ));
    }

    #[test]
    fn walks_load_commands() {
        let mut image = build_image(&["/usr/lib/libSystem.B.dylib"], 64);
        let mach = MachFile::parse(&mut image).unwrap();
        let commands = mach.load_commands().unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].cmd, LC_SEGMENT_64);
        assert_eq!(commands[1].cmd, LC_LOAD_DYLINKER);
        assert_eq!(commands[2].cmd, LC_LOAD_DYLIB);
        assert_eq!(
            mach.command_name(&commands[2]).unwrap(),
            b"/usr/lib/libSystem.B.dylib"
        );
    }

    #[test]
    fn detects_truncated_commands() {
        let mut image = build_image(&["/usr/lib/libSystem.B.dylib"], 64);
        // Claim one more command than the area holds.
        let ncmds: u32 = image.as_slice().pread_with(16, LE).unwrap();
        image.pwrite_with(ncmds + 1, 16, LE).unwrap();
        let mach = MachFile::parse(&mut image).unwrap();
        assert!(matches!(
            mach.load_commands(),
            Err(PatchError::TruncatedCommands { .. })
        ));
    }

    #[test]
    fn finds_segments_and_reserve_end() {
        let mut image = build_image(&[], 128);
        let mach = MachFile::parse(&mut image).unwrap();
        let text = mach.find_segment("__TEXT").unwrap().unwrap();
        assert_eq!(text.fileoff, mach.first_segment_fileoff().unwrap().unwrap());
        assert!(mach.find_segment("__DATA").unwrap().is_none());
    }

    #[test]
    fn missing_dyld_info() {
        let mut image = build_image(&[], 64);
        let mach = MachFile::parse(&mut image).unwrap();
        assert!(matches!(mach.dyld_info(), Err(PatchError::MissingDyldInfo)));
    }

    #[test]
    fn ordinal_space_counts_dylinker_as_zero() {
        let mut image = build_image(&["/usr/lib/libSystem.B.dylib", "/usr/lib/libc++.1.dylib"], 64);
        let mach = MachFile::parse(&mut image).unwrap();
        assert_eq!(mach.dylib_ordinal("/usr/lib/dyld").unwrap(), Some(0));
        assert_eq!(
            mach.dylib_ordinal("/usr/lib/libSystem.B.dylib").unwrap(),
            Some(1)
        );
        assert_eq!(
            mach.dylib_ordinal("/usr/lib/libc++.1.dylib").unwrap(),
            Some(2)
        );
        assert_eq!(mach.dylib_ordinal("/usr/lib/libz.dylib").unwrap(), None);
    }

    #[test]
    fn builds_dylib_command_shape() {
        let name = "@executable_path/hook.dylib";
        let block = build_dylib_command(name).unwrap();
        assert_eq!(block.len(), 56);
        let cmd: u32 = block.as_slice().pread_with(0, LE).unwrap();
        let cmdsize: u32 = block.as_slice().pread_with(4, LE).unwrap();
        let name_off: u32 = block.as_slice().pread_with(8, LE).unwrap();
        let timestamp: u32 = block.as_slice().pread_with(12, LE).unwrap();
        assert_eq!(cmd, LC_LOAD_DYLIB);
        assert_eq!(cmdsize, 56);
        assert_eq!(name_off, 24);
        assert_eq!(timestamp, 2);
        assert_eq!(&block[24..24 + name.len()], name.as_bytes());
        assert_eq!(block[24 + name.len()], 0);
    }

    #[test]
    fn append_into_reserve() {
        let mut image = build_image(&["/usr/lib/libSystem.B.dylib"], 512);
        let before = image.clone();
        let block = build_dylib_command("@executable_path/hook.dylib").unwrap();
        let mut mach = MachFile::parse(&mut image).unwrap();
        let gap_start = SIZEOF_HEADER_64 + mach.header().sizeofcmds as usize;
        mach.append_load_command(&block).unwrap();

        let before_header: (u32, u32) = (
            before.as_slice().pread_with(16, LE).unwrap(),
            before.as_slice().pread_with(20, LE).unwrap(),
        );
        let ncmds_after: u32 = mach.bytes().pread_with(16, LE).unwrap();
        let sizeofcmds_after: u32 = mach.bytes().pread_with(20, LE).unwrap();
        assert_eq!(ncmds_after, before_header.0 + 1);
        assert_eq!(sizeofcmds_after, before_header.1 + 56);
        assert_eq!(&mach.bytes()[gap_start..gap_start + 56], block.as_slice());
        assert_eq!(
            mach.dylib_ordinal("@executable_path/hook.dylib").unwrap(),
            Some(2)
        );
    }

    #[test]
    fn append_needs_space() {
        let mut image = build_image(&["/usr/lib/libSystem.B.dylib"], 32);
        let before = image.clone();
        let block = build_dylib_command("@executable_path/hook.dylib").unwrap();
        let mut mach = MachFile::parse(&mut image).unwrap();
        assert!(matches!(
            mach.append_load_command(&block),
            Err(PatchError::InsufficientHeaderSpace {
                needed: 56,
                available: 32
            })
        ));
        assert_eq!(image, before);
    }

    #[test]
    fn append_needs_zeroed_reserve() {
        let mut image = build_image(&[], 512);
        let gap_start = {
            let mach = MachFile::parse(&mut image).unwrap();
            SIZEOF_HEADER_64 + mach.header().sizeofcmds as usize
        };
        image[gap_start + 8] = 0xff;
        let before = image.clone();
        let block = build_dylib_command("@executable_path/hook.dylib").unwrap();
        let mut mach = MachFile::parse(&mut image).unwrap();
        assert!(matches!(
            mach.append_load_command(&block),
            Err(PatchError::HeaderNotZeroPadded(_))
        ));
        assert_eq!(image, before);
    }
}
