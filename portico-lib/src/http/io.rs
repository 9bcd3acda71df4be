use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}
pub type BoxedIo = Box<dyn IoStream>;

const READ_CHUNK: usize = 8192;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

/// A buffered stream enforcing a deadline on every read and write, the
/// moral equivalent of a poll-guarded socket. One `Conn` owns one side of
/// a proxied exchange.
pub struct Conn {
    stream: BoxedIo,
    buf: Vec<u8>,
    pos: usize,
    deadline: Duration,
}

impl Conn {
    pub fn new(stream: BoxedIo, deadline: Duration) -> Conn {
        Conn { stream, buf: Vec::new(), pos: 0, deadline }
    }

    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = deadline;
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Bytes already read off the wire but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Refill the buffer if empty. Returns the number of buffered bytes;
    /// zero means EOF.
    async fn fill_buf(&mut self) -> io::Result<usize> {
        if self.pos < self.buf.len() {
            return Ok(self.buf.len() - self.pos);
        }
        self.buf.clear();
        self.buf.resize(READ_CHUNK, 0);
        self.pos = 0;
        let n = match timeout(self.deadline, self.stream.read(&mut self.buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.buf.clear();
                return Err(e);
            }
            Err(_) => {
                self.buf.clear();
                return Err(timed_out());
            }
        };
        self.buf.truncate(n);
        Ok(n)
    }

    async fn read_byte(&mut self) -> io::Result<u8> {
        if self.fill_buf().await? == 0 {
            return Err(eof());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    async fn skip_to_nl(&mut self) -> io::Result<()> {
        loop {
            if self.read_byte().await? == b'\n' {
                return Ok(());
            }
        }
    }

    /// Read one header/request line, stripping the CRLF (or bare LF)
    /// terminator. A line with stray control characters, a CR not
    /// followed by LF, or longer than `max` is skipped through its
    /// newline and reported as invalid.
    pub async fn read_line(&mut self, max: usize) -> io::Result<String> {
        let mut line: Vec<u8> = Vec::new();
        let mut seen_cr = false;
        loop {
            let b = self.read_byte().await?;
            if seen_cr {
                if b == b'\n' {
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                self.skip_to_nl().await?;
                return Err(invalid("CR not followed by LF"));
            }
            match b {
                b'\r' => seen_cr = true,
                b'\n' => return Ok(String::from_utf8_lossy(&line).into_owned()),
                b'\t' => line.push(b),
                0x00..=0x1f | 0x7f => {
                    self.skip_to_nl().await?;
                    return Err(invalid("control character in line"));
                }
                _ => {
                    if line.len() >= max {
                        self.skip_to_nl().await?;
                        return Err(invalid("line too long"));
                    }
                    line.push(b);
                }
            }
        }
    }

    /// Read whatever is available, buffered bytes first. Returns 0 at EOF.
    pub async fn read_some(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let avail = self.fill_buf().await?;
        if avail == 0 {
            return Ok(0);
        }
        let n = avail.min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Like `read_some` without the deadline; used by the tunnel pump,
    /// which bounds idleness with its own timer.
    pub async fn read_some_raw(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buffered() > 0 {
            let n = self.buffered().min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.stream.read(out).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match timeout(self.deadline, self.stream.write_all(data)).await {
            Ok(res) => res,
            Err(_) => Err(timed_out()),
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match timeout(self.deadline, self.stream.flush()).await {
            Ok(res) => res,
            Err(_) => Err(timed_out()),
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_from(data: &[u8]) -> Conn {
        let cursor = std::io::Cursor::new(data.to_vec());
        Conn::new(Box::new(cursor), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn reads_crlf_and_lf_lines() {
        let mut c = conn_from(b"first\r\nsecond\nthird\r\n");
        assert_eq!(c.read_line(4096).await.unwrap(), "first");
        assert_eq!(c.read_line(4096).await.unwrap(), "second");
        assert_eq!(c.read_line(4096).await.unwrap(), "third");
        assert!(c.read_line(4096).await.is_err());
    }

    #[tokio::test]
    async fn stray_cr_is_invalid_and_line_is_skipped() {
        let mut c = conn_from(b"bad\rline\nnext\r\n");
        let err = c.read_line(4096).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(c.read_line(4096).await.unwrap(), "next");
    }

    #[tokio::test]
    async fn long_line_is_skipped() {
        let mut data = vec![b'a'; 100];
        data.extend_from_slice(b"\r\nok\r\n");
        let mut c = conn_from(&data);
        assert!(c.read_line(10).await.is_err());
        assert_eq!(c.read_line(10).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn tab_is_allowed_other_controls_are_not() {
        let mut c = conn_from(b"a\tb\r\n");
        assert_eq!(c.read_line(4096).await.unwrap(), "a\tb");
        let mut c = conn_from(b"a\x01b\r\nnext\r\n");
        assert!(c.read_line(4096).await.is_err());
        assert_eq!(c.read_line(4096).await.unwrap(), "next");
    }

    #[tokio::test]
    async fn read_some_drains_buffer_then_stream() {
        let mut c = conn_from(b"head\r\nbody");
        assert_eq!(c.read_line(4096).await.unwrap(), "head");
        let mut out = [0u8; 16];
        let n = c.read_some(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"body");
    }
}
