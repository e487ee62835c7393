//! Reader for rtptools `rtpdump` captures.
//!
//! File layout:
//! ```text
//! #!rtpplay1.0 address/port\n
//! start.sec u32 | start.usec u32 | source u32 | port u16 | padding u16
//! { length u16 | plen u16 | offset_ms u32 | packet bytes }*
//! ```
//! `length` includes the 8-byte record header. `plen` is the original packet
//! length for RTP and 0 for RTCP records. All integers are big-endian.

use std::io::{BufRead, ErrorKind, Read};
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

const MAGIC: &str = "#!rtpplay1.0 ";
const FILE_HEADER_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 8;

/// Capture metadata from the file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHeader {
    /// `address/port` from the text line.
    pub endpoint: String,
    /// Capture start, seconds and microseconds since the Unix epoch.
    pub start_sec: u32,
    pub start_usec: u32,
    pub source: Ipv4Addr,
    pub port: u16,
}

/// One captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRecord {
    /// Time since the start of the capture.
    pub offset: Duration,
    pub is_rtcp: bool,
    pub data: Vec<u8>,
}

pub struct RtpDumpReader<R> {
    inner: R,
    header: DumpHeader,
    /// Set once iteration hit the end or an error; the stream position is
    /// unknown after a failed read.
    done: bool,
}

impl<R: BufRead> RtpDumpReader<R> {
    /// Read and validate the file headers.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut line = String::new();
        inner
            .read_line(&mut line)
            .context("Failed to read rtpdump header line")?;
        let Some(endpoint) = line.strip_prefix(MAGIC) else {
            bail!("Not an rtpdump file (missing {:?})", MAGIC.trim_end());
        };
        let endpoint = endpoint.trim_end().to_string();

        let mut hdr = [0u8; FILE_HEADER_SIZE];
        inner
            .read_exact(&mut hdr)
            .context("Truncated rtpdump file header")?;

        let header = DumpHeader {
            endpoint,
            start_sec: u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]),
            start_usec: u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]),
            source: Ipv4Addr::new(hdr[8], hdr[9], hdr[10], hdr[11]),
            port: u16::from_be_bytes([hdr[12], hdr[13]]),
        };
        tracing::debug!("rtpdump capture of {}", header.endpoint);

        Ok(Self {
            inner,
            header,
            done: false,
        })
    }

    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    /// Next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<DumpRecord>> {
        let mut hdr = [0u8; RECORD_HEADER_SIZE];
        match self.fill(&mut hdr)? {
            0 => return Ok(None),
            RECORD_HEADER_SIZE => {}
            n => bail!(
                "Truncated rtpdump record header ({} of {} bytes)",
                n,
                RECORD_HEADER_SIZE
            ),
        }

        let length = u16::from_be_bytes([hdr[0], hdr[1]]) as usize;
        let plen = u16::from_be_bytes([hdr[2], hdr[3]]);
        let offset_ms = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);

        if length < RECORD_HEADER_SIZE {
            bail!("Invalid rtpdump record length {}", length);
        }
        let mut data = vec![0u8; length - RECORD_HEADER_SIZE];
        self.inner
            .read_exact(&mut data)
            .context("Truncated rtpdump record")?;

        Ok(Some(DumpRecord {
            offset: Duration::from_millis(u64::from(offset_ms)),
            is_rtcp: plen == 0,
            data,
        }))
    }

    /// Read until `buf` is full or the input ends. Returns the bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("Failed to read rtpdump record"),
            }
        }
        Ok(filled)
    }
}

impl<R: BufRead> Iterator for RtpDumpReader<R> {
    type Item = Result<DumpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.next_record().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}
