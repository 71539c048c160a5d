//! Binary trace-dump files
//!
//! Layout: a fixed little-endian header (counts, node device-type table,
//! driver version, wall-clock timestamp) followed by the send-trace records
//! and then the receive-trace records. Dump files rotate through a small
//! fixed set of names so a misbehaving link cannot fill the disk.

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::log::{RecvRecord, SendRecord};
use crate::link::packet::{MAX_NODES, WIRE_FRAME_MAX};

/// Dump format marker; bump when the record layout changes
const DUMP_FORMAT: u32 = 300;

/// Number of dump files kept before the numbering wraps
pub const DUMP_FILE_WRAP: u32 = 10;

/// Fixed header of a trace dump
#[derive(Debug, Clone)]
pub struct DumpHeader {
    /// Nodes on the link when the dump was taken
    pub node_count: u32,
    /// Device ID of each node slot (0 where no node)
    pub node_types: [u16; MAX_NODES],
    /// Root-cause error code, 0 if the dump was requested manually
    pub root_error: u16,
}

fn write_send_record<W: Write>(w: &mut W, rec: &SendRecord) -> io::Result<()> {
    w.write_f64::<LittleEndian>(rec.timestamp_ms)?;
    w.write_u32::<LittleEndian>(rec.serial)?;
    w.write_u32::<LittleEndian>(rec.depth)?;
    w.write_u16::<LittleEndian>(rec.error)?;
    write_frame(w, &rec.frame)
}

fn write_recv_record<W: Write>(w: &mut W, rec: &RecvRecord) -> io::Result<()> {
    w.write_f64::<LittleEndian>(rec.timestamp_ms)?;
    w.write_u32::<LittleEndian>(rec.serial)?;
    w.write_u32::<LittleEndian>(rec.matched_send.unwrap_or(u32::MAX))?;
    w.write_u32::<LittleEndian>(rec.node_count)?;
    w.write_u16::<LittleEndian>(rec.error)?;
    write_frame(w, &rec.frame)
}

fn write_frame<W: Write>(w: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = frame.len().min(WIRE_FRAME_MAX);
    w.write_u8(len as u8)?;
    w.write_all(&frame[..len])?;
    // Pad to the fixed record width
    let pad = [0u8; WIRE_FRAME_MAX];
    w.write_all(&pad[len..])
}

/// Write a complete dump to `path`
pub fn write_dump(
    path: &Path,
    header: &DumpHeader,
    send: &[SendRecord],
    recv: &[RecvRecord],
) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);

    w.write_u32::<LittleEndian>(DUMP_FORMAT)?;
    w.write_u32::<LittleEndian>(header.node_count)?;
    for &dev in &header.node_types {
        w.write_u16::<LittleEndian>(dev)?;
    }
    w.write_u16::<LittleEndian>(header.root_error)?;
    w.write_u32::<LittleEndian>(pkg_version())?;
    w.write_i64::<LittleEndian>(Utc::now().timestamp_millis())?;
    w.write_u32::<LittleEndian>(send.len() as u32)?;
    w.write_u32::<LittleEndian>(recv.len() as u32)?;

    for rec in send {
        write_send_record(&mut w, rec)?;
    }
    for rec in recv {
        write_recv_record(&mut w, rec)?;
    }
    w.flush()
}

/// Pick the next dump file name in `dir` (wrapping rotation) and write there.
/// Returns the path written.
pub fn dump_next(
    dir: &Path,
    counter: u32,
    header: &DumpHeader,
    send: &[SendRecord],
    recv: &[RecvRecord],
) -> io::Result<PathBuf> {
    let path = dir.join(format!("linkdump{}.mtrace", counter % DUMP_FILE_WRAP));
    write_dump(&path, header, send, recv)?;
    Ok(path)
}

/// Driver version packed as major*10000 + minor*100 + patch
fn pkg_version() -> u32 {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    major * 10000 + minor * 100 + patch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> DumpHeader {
        let mut node_types = [0u16; MAX_NODES];
        node_types[0] = 0x2D01;
        node_types[1] = 0x2D02;
        DumpHeader {
            node_count: 2,
            node_types,
            root_error: 0x104,
        }
    }

    #[test]
    fn test_dump_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.mtrace");
        let send = vec![SendRecord {
            timestamp_ms: 1.5,
            serial: 7,
            depth: 2,
            frame: vec![0x83, 0x02, 0x05, 0x01, 0x75],
            error: 0,
        }];
        let recv = vec![RecvRecord {
            timestamp_ms: 2.5,
            serial: 0,
            matched_send: Some(7),
            node_count: 1,
            frame: vec![],
            error: 0x104,
        }];
        write_dump(&path, &sample_header(), &send, &recv).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // format marker
        assert_eq!(&bytes[0..4], &DUMP_FORMAT.to_le_bytes());
        // node count
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        // first node type
        assert_eq!(&bytes[8..10], &0x2D01u16.to_le_bytes());
        // header (4+4+32+2+4+8+4+4) + one send + one recv record
        let header_len = 62;
        let send_len = 8 + 4 + 4 + 2 + 1 + WIRE_FRAME_MAX;
        let recv_len = 8 + 4 + 4 + 4 + 2 + 1 + WIRE_FRAME_MAX;
        assert_eq!(bytes.len(), header_len + send_len + recv_len);
    }

    #[test]
    fn test_dump_rotation_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let header = sample_header();
        let p0 = dump_next(dir.path(), 0, &header, &[], &[]).unwrap();
        let p10 = dump_next(dir.path(), DUMP_FILE_WRAP, &header, &[], &[]).unwrap();
        assert_eq!(p0, p10);
        let p3 = dump_next(dir.path(), 3, &header, &[], &[]).unwrap();
        assert_ne!(p0, p3);
    }
}
