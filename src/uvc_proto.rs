// derived from https://github.com/torvalds/linux/blob/master/include/uapi/linux/usb/video.h
use std::io::Write;

use crate::logger::LogSink;

// 2.4.3.3 Video and Still Image Payload Headers
pub const UVC_STREAM_FID: u8 = 1 << 0;
pub const UVC_STREAM_EOF: u8 = 1 << 1;
pub const UVC_STREAM_PTS: u8 = 1 << 2;
pub const UVC_STREAM_SCR: u8 = 1 << 3;
pub const UVC_STREAM_RES: u8 = 1 << 4;
pub const UVC_STREAM_STI: u8 = 1 << 5;
pub const UVC_STREAM_ERR: u8 = 1 << 6;
pub const UVC_STREAM_EOH: u8 = 1 << 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvcPayloadHeader {
    pub b_header_length: u8,
    pub bm_header_info: u8,
    pub dw_presentation_time: u32,
}

impl UvcPayloadHeader {
    pub fn new(eof: bool, frame_id: bool, pts: u32) -> UvcPayloadHeader {
        let flags: u8 = if eof { UVC_STREAM_EOF } else { 0 }
            | if frame_id { UVC_STREAM_FID } else { 0 }
            | UVC_STREAM_PTS
            | UVC_STREAM_EOH;
        UvcPayloadHeader {
            b_header_length: UvcPayloadHeader::size() as u8,
            bm_header_info: flags,
            dw_presentation_time: pts,
        }
    }

    pub fn size() -> usize {
        let format = structure!("<BBI");
        return format.size();
    }

    pub fn fid(&self) -> u8 {
        self.bm_header_info & UVC_STREAM_FID
    }

    pub fn has(&self, flag: u8) -> bool {
        self.bm_header_info & flag != 0
    }

    pub fn serialize(&self, mut buffer: impl Write) -> std::io::Result<()> {
        let format = structure!("<BBI");
        format.pack_into(&mut buffer, self.b_header_length, self.bm_header_info, self.dw_presentation_time)?;
        return Ok(());
    }

    /// One payload chunk: this header followed by `payload`.
    pub fn chunk(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.b_header_length as usize + payload.len());
        let _ = self.serialize(&mut out);
        out.resize(self.b_header_length as usize, 0);
        out.extend_from_slice(payload);
        out
    }
}

/// What the assembler wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerStatus {
    NeedData,
    /// A new frame started and no destination is bound; bind one and feed the
    /// same chunk again.
    NeedBuffer,
    /// The bound destination holds a complete frame; bind a fresh one.
    FrameComplete,
}

/// Rebuilds frames from the bridge's UVC-style payload chunks.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    frame_len: usize,
    discard: bool,
    last_pts: u32,
    last_fid: u8,
    log: LogSink,
}

impl FrameAssembler {
    pub fn new(log: LogSink) -> FrameAssembler {
        FrameAssembler { log, ..Default::default() }
    }

    pub fn is_discarding(&self) -> bool {
        self.discard
    }

    /// Feeds one chunk. `frame` is the bound destination, if any; an absent
    /// destination behaves like an empty one.
    pub fn put(&mut self, data: &[u8], frame: Option<&mut [u8]>) -> AssemblerStatus {
        let frame: &mut [u8] = match frame {
            Some(f) => f,
            None => &mut [],
        };

        if data.is_empty() {
            return AssemblerStatus::NeedData;
        }

        let header_len = data[0] as usize;
        if header_len < 2 || data.len() < header_len {
            sink_error!(self.log, "bad header: {} {}", header_len, data.len());
            self.discard = true;
            return AssemblerStatus::NeedData;
        }

        let info = data[1];
        if info & UVC_STREAM_ERR != 0 {
            sink_error!(self.log, "ERR bit in header: {:#04x}", info);
            self.discard = true;
            return AssemblerStatus::NeedData;
        }

        if info & UVC_STREAM_PTS == 0 {
            sink_error!(self.log, "no PTS in header: {:#04x}", info);
            self.discard = true;
            return AssemblerStatus::NeedData;
        }

        if header_len < UvcPayloadHeader::size() {
            sink_error!(self.log, "PTS flagged but header is only {} bytes", header_len);
            self.discard = true;
            return AssemblerStatus::NeedData;
        }

        let pts = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
        let fid = info & UVC_STREAM_FID;
        let payload = &data[header_len..];
        let eof = info & UVC_STREAM_EOF != 0;

        if pts != self.last_pts || fid != self.last_fid {
            // changed PTS or toggled FID: the previous frame is over
            self.frame_len = 0;
            self.discard = false;
            self.last_pts = pts;
            self.last_fid = fid;

            if frame.is_empty() {
                return AssemblerStatus::NeedBuffer;
            }
        } else if eof {
            // whatever follows an EOF starts a new frame
            self.last_pts = 0;

            if self.frame_len + payload.len() != frame.len() {
                sink_debug!(
                    self.log,
                    "incorrect final frame size: {} + {} != {}",
                    self.frame_len,
                    payload.len(),
                    frame.len()
                );
                self.discard = true;
            }
        }

        if self.discard {
            return AssemblerStatus::NeedData;
        }

        if self.frame_len + payload.len() <= frame.len() {
            frame[self.frame_len..self.frame_len + payload.len()].copy_from_slice(payload);
            self.frame_len += payload.len();
            sink_trace!(self.log, "chunk pts {} fid {} -> {} bytes", pts, fid, self.frame_len);

            if eof {
                self.frame_len = 0;
                return AssemblerStatus::FrameComplete;
            }
        } else {
            sink_debug!(self.log, "frame overflow: {} + {} > {}", self.frame_len, payload.len(), frame.len());
            self.discard = true;
        }

        AssemblerStatus::NeedData
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::logger::setup_logger;
    use crate::testing::CaptureLog;

    fn setup() -> FrameAssembler {
        setup_logger();
        FrameAssembler::new(LogSink::global())
    }

    fn chunk(eof: bool, fid: bool, pts: u32, payload: &[u8]) -> Vec<u8> {
        UvcPayloadHeader::new(eof, fid, pts).chunk(payload)
    }

    #[test]
    fn header_layout() {
        let c = chunk(true, true, 0x0403_0201, &[9]);
        assert_eq!(c, vec![6, 0x87, 1, 2, 3, 4, 9]);
    }

    #[test]
    fn two_chunk_frame_completes_once() {
        let mut asm = setup();
        let mut frame = vec![0u8; 6];
        let first = chunk(false, false, 100, &[1, 2, 3]);
        let last = chunk(true, false, 100, &[4, 5, 6]);

        assert_eq!(asm.put(&first, None), AssemblerStatus::NeedBuffer);
        assert_eq!(asm.put(&first, Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&last, Some(&mut frame)), AssemblerStatus::FrameComplete);
        assert!(!asm.is_discarding());
        assert_eq!(frame, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn short_final_chunk_discards_frame() {
        let mut asm = setup();
        let mut frame = vec![0u8; 8];
        let first = chunk(false, false, 7, &[1, 2, 3]);
        let last = chunk(true, false, 7, &[4, 5, 6]);

        assert_eq!(asm.put(&first, Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&last, Some(&mut frame)), AssemblerStatus::NeedData);
        assert!(asm.is_discarding());
    }

    #[test]
    fn overflow_discards_until_next_frame() {
        let mut asm = setup();
        let mut frame = vec![0u8; 4];
        assert_eq!(asm.put(&chunk(false, false, 1, &[1, 2, 3]), Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&chunk(false, false, 1, &[4, 5, 6]), Some(&mut frame)), AssemblerStatus::NeedData);
        assert!(asm.is_discarding());
        assert_eq!(asm.put(&chunk(true, false, 1, &[7]), Some(&mut frame)), AssemblerStatus::NeedData);

        // toggled FID resynchronizes
        assert_eq!(asm.put(&chunk(false, true, 2, &[1, 2]), Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&chunk(true, true, 2, &[3, 4]), Some(&mut frame)), AssemblerStatus::FrameComplete);
        assert_eq!(frame, vec![1, 2, 3, 4]);
    }

    #[test]
    fn malformed_chunks_are_logged_not_raised() {
        setup_logger();
        let capture = Arc::new(CaptureLog::default());
        let mut asm = FrameAssembler::new(LogSink::new(capture.clone()));
        let mut frame = vec![0u8; 4];

        assert_eq!(asm.put(&[], Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&[1, 0x84], Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&[12, 0x84, 0, 0], Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&[2, 0x80, 1, 2], Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&[2, 0x84, 1, 2], Some(&mut frame)), AssemblerStatus::NeedData);
        let mut err = chunk(false, false, 3, &[1]);
        err[1] |= UVC_STREAM_ERR;
        assert_eq!(asm.put(&err, Some(&mut frame)), AssemblerStatus::NeedData);

        assert!(capture.contains("bad header: 1 2"));
        assert!(capture.contains("no PTS"));
        assert!(capture.contains("ERR bit"));
        assert!(capture.contains("only 2 bytes"));
    }

    #[test]
    fn eof_resets_timestamp_tracking() {
        let mut asm = setup();
        let mut frame = vec![0u8; 2];
        assert_eq!(asm.put(&chunk(false, false, 5, &[1]), Some(&mut frame)), AssemblerStatus::NeedData);
        assert_eq!(asm.put(&chunk(true, false, 5, &[2]), Some(&mut frame)), AssemblerStatus::FrameComplete);
        // same pts and fid again still counts as a new frame
        assert_eq!(asm.put(&chunk(false, false, 5, &[3]), None), AssemblerStatus::NeedBuffer);
    }
}
