//! Server-Sent-Events observers.
//!
//! Each accepted connection on the `--event-source` socket is answered
//! with a bare HTTP response header and then mirrors the payload's output
//! as framed JSON events:
//!
//! ```text
//! data:{"offset":0,"data":"hello\r\n","end_offset":7}
//! id:7
//! ```
//!
//! Offsets are absolute positions in the main output buffer, so a client
//! can resume with `Last-Event-ID`. A final `{"done":true}` event marks
//! termination.

use std::os::unix::io::RawFd;

use crate::buffer::StreamBuf;

const HEADER: &[u8] = b"HTTP/1.1 200 OK\r\nCache-Control: no-store\r\n\
Content-Type: text/event-stream\r\nX-Accel-Buffering: no\r\n\r\n";

pub struct EventStream {
    pub fd: RawFd,
    pub buf: StreamBuf,
    /// Position in the main output buffer up to which events were framed.
    pub output_off: u64,
    /// Write position within `buf`.
    pub off: u64,
}

impl EventStream {
    /// Wrap a freshly accepted connection, starting at `output_off` in
    /// the main buffer.
    pub fn new(fd: RawFd, output_off: u64) -> Self {
        let buf = StreamBuf::new(4096);
        let off = buf.start();
        Self {
            fd,
            buf,
            output_off,
            off,
        }
    }

    /// Queue the HTTP prologue. Sent directly; the event framing follows
    /// through the owned buffer.
    pub fn write_header(&self) {
        // SAFETY: fd is the accepted connection; partial writes only cost
        // a truncated header on a client that is already misbehaving.
        unsafe {
            libc::write(self.fd, HEADER.as_ptr().cast::<libc::c_void>(), HEADER.len());
        }
    }

    /// Frame everything new in `output` since `output_off` as one event.
    pub fn write_event(&mut self, output: &StreamBuf) {
        let pending = output.slice_from(self.output_off);
        self.buf
            .append(format!("data:{{\"offset\":{},\"data\":\"", self.output_off).as_bytes());
        let consumed = self.buf.append_json_chars(pending);
        let new_off = self.output_off + consumed as u64;
        self.buf
            .append(format!("\",\"end_offset\":{}}}\nid:{}\n\n", new_off, new_off).as_bytes());
        self.output_off = new_off;
    }

    /// Queue the final event.
    pub fn write_done(&mut self) {
        self.buf.append(b"data:{\"done\":true}\n\n");
    }

    /// Flush queued bytes to the subscriber. Returns whether progress was
    /// made; a closed connection marks the buffer writer closed.
    pub fn flush(&mut self) -> bool {
        let mut off = self.off;
        let any = self.buf.write(self.fd, &mut off);
        if any {
            self.off = off;
            self.buf.consume_to(off);
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_framing() {
        let mut output = StreamBuf::new(64);
        output.append(b"hi\n");
        let mut es = EventStream::new(-1, output.start());
        es.write_event(&output);
        assert_eq!(
            es.buf.pending(),
            b"data:{\"offset\":0,\"data\":\"hi\\n\",\"end_offset\":3}\nid:3\n\n"
        );
        assert_eq!(es.output_off, 3);
    }

    #[test]
    fn event_offsets_are_monotonic() {
        let mut output = StreamBuf::new(64);
        output.set_origin(100);
        output.append(b"abc");
        let mut es = EventStream::new(-1, output.start());
        es.write_event(&output);
        assert_eq!(es.output_off, 103);
        output.append(b"def");
        es.write_event(&output);
        assert_eq!(es.output_off, 106);
        let text = String::from_utf8_lossy(es.buf.pending()).into_owned();
        assert!(text.contains("\"offset\":100"));
        assert!(text.contains("\"end_offset\":103"));
        assert!(text.contains("\"offset\":103"));
        assert!(text.contains("\"end_offset\":106"));
    }

    #[test]
    fn done_event() {
        let mut es = EventStream::new(-1, 0);
        es.write_done();
        assert_eq!(es.buf.pending(), b"data:{\"done\":true}\n\n");
    }
}
