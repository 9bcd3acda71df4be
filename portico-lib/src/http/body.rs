use std::io;
use std::time::Duration;

use super::io::Conn;

const COPY_CHUNK: usize = 8192;
const MAX_LINE: usize = 4096;

fn proto_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Copy exactly `cont` body bytes from `src` to `dst`. `None` destination
/// discards (a request routed to an internal backend still consumes its
/// body). Byte count is accumulated into `res_bytes`.
pub async fn copy_bin(
    src: &mut Conn,
    mut dst: Option<&mut Conn>,
    cont: u64,
    res_bytes: &mut u64,
) -> io::Result<()> {
    let mut remaining = cont;
    let mut buf = [0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = (remaining as usize).min(buf.len());
        let n = src.read_some(&mut buf[..want]).await?;
        if n == 0 {
            return Err(proto_err("short body"));
        }
        if let Some(d) = dst.as_deref_mut() {
            d.write_all(&buf[..n]).await?;
        }
        remaining -= n as u64;
        *res_bytes += n as u64;
    }
    if let Some(d) = dst {
        d.flush().await?;
    }
    Ok(())
}

fn parse_chunk_size(line: &str) -> io::Result<u64> {
    let digits: &str = match line.find(|c: char| !c.is_ascii_hexdigit()) {
        Some(0) => return Err(proto_err("bad chunk header")),
        Some(end) => {
            // only a chunk extension may follow the size
            let rest = line[end..].trim_start();
            if !rest.is_empty() && !rest.starts_with(';') {
                return Err(proto_err("bad chunk header"));
            }
            &line[..end]
        }
        None if line.is_empty() => return Err(proto_err("bad chunk header")),
        None => line,
    };
    u64::from_str_radix(digits, 16).map_err(|_| proto_err("bad chunk header"))
}

/// Copy a chunked body, re-emitting the framing verbatim, including
/// trailers. EOF at a chunk boundary ends the transfer without error.
/// `max_size` of zero means unbounded.
pub async fn copy_chunks(
    src: &mut Conn,
    mut dst: Option<&mut Conn>,
    res_bytes: &mut u64,
    max_size: u64,
) -> io::Result<()> {
    let mut total = 0u64;
    loop {
        let line = match src.read_line(MAX_LINE).await {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let size = parse_chunk_size(&line)?;

        if let Some(d) = dst.as_deref_mut() {
            d.write_all(line.as_bytes()).await?;
            d.write_all(b"\r\n").await?;
        }

        total += size;
        if max_size > 0 && total > max_size {
            return Err(proto_err("chunked content too large"));
        }

        if size == 0 {
            break;
        }
        copy_bin(src, dst.as_deref_mut(), size, res_bytes).await?;

        // CRLF that closes the chunk
        let sep = src.read_line(MAX_LINE).await?;
        if !sep.is_empty() {
            return Err(proto_err("garbage after chunk"));
        }
        if let Some(d) = dst.as_deref_mut() {
            d.write_all(b"\r\n").await?;
        }
    }

    // trailing headers, through the blank line
    loop {
        let line = match src.read_line(MAX_LINE).await {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        if let Some(d) = dst.as_deref_mut() {
            d.write_all(line.as_bytes()).await?;
            d.write_all(b"\r\n").await?;
        }
        if line.is_empty() {
            break;
        }
    }

    if let Some(d) = dst {
        d.flush().await?;
    }
    Ok(())
}

/// Copy until the source closes, as the RPC tunnel and unframed HTTP/1.0
/// responses require. A deadline on the very first read means "no body"
/// rather than an error; `limit` bounds the total (0 = unbounded).
pub async fn copy_until_eof(
    src: &mut Conn,
    mut dst: Option<&mut Conn>,
    res_bytes: &mut u64,
    limit: u64,
) -> io::Result<()> {
    let mut buf = [0u8; COPY_CHUNK];
    let mut first = true;
    loop {
        let n = match src.read_some(&mut buf).await {
            Ok(n) => n,
            Err(e) if first && e.kind() == io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        first = false;
        *res_bytes += n as u64;
        if limit > 0 && *res_bytes > limit {
            return Err(proto_err("declared length exceeded"));
        }
        if let Some(d) = dst.as_deref_mut() {
            d.write_all(&buf[..n]).await?;
            d.flush().await?;
        }
    }
    if let Some(d) = dst {
        d.flush().await?;
    }
    Ok(())
}

/// Bidirectional byte pump for an upgraded connection. Ends when either
/// side closes, errors, or nothing moves for `idle`. Returns bytes sent
/// toward the client.
pub async fn tunnel(cl: &mut Conn, be: &mut Conn, idle: Duration) -> io::Result<u64> {
    let mut to_client = 0u64;
    let mut cbuf = [0u8; COPY_CHUNK];
    let mut bbuf = [0u8; COPY_CHUNK];
    loop {
        tokio::select! {
            r = cl.read_some_raw(&mut cbuf) => {
                let n = r?;
                if n == 0 {
                    break;
                }
                be.write_all(&cbuf[..n]).await?;
                be.flush().await?;
            }
            r = be.read_some_raw(&mut bbuf) => {
                let n = r?;
                if n == 0 {
                    break;
                }
                to_client += n as u64;
                cl.write_all(&bbuf[..n]).await?;
                cl.flush().await?;
            }
            _ = tokio::time::sleep(idle) => break,
        }
    }
    Ok(to_client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_from(data: &[u8]) -> Conn {
        Conn::new(
            Box::new(std::io::Cursor::new(data.to_vec())),
            Duration::from_secs(1),
        )
    }

    fn sink() -> Conn {
        Conn::new(
            Box::new(std::io::Cursor::new(Vec::new())),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn copy_bin_counts_exactly() {
        let mut src = conn_from(b"hello world");
        let mut dst = sink();
        let mut n = 0;
        copy_bin(&mut src, Some(&mut dst), 5, &mut n).await.unwrap();
        assert_eq!(n, 5);
    }

    #[tokio::test]
    async fn copy_bin_short_body_errors() {
        let mut src = conn_from(b"abc");
        let mut n = 0;
        assert!(copy_bin(&mut src, None, 10, &mut n).await.is_err());
    }

    #[tokio::test]
    async fn chunked_body_with_trailers() {
        let body = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: v\r\n\r\n";
        let mut src = conn_from(body);
        let mut n = 0;
        copy_chunks(&mut src, None, &mut n, 0).await.unwrap();
        assert_eq!(n, 11);
    }

    #[tokio::test]
    async fn chunked_rejects_bad_header() {
        let mut src = conn_from(b"zz\r\nhello\r\n");
        let mut n = 0;
        assert!(copy_chunks(&mut src, None, &mut n, 0).await.is_err());
    }

    #[tokio::test]
    async fn chunked_respects_max_size() {
        let mut src = conn_from(b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n");
        let mut n = 0;
        assert!(copy_chunks(&mut src, None, &mut n, 6).await.is_err());
    }

    #[tokio::test]
    async fn until_eof_counts_all() {
        let mut src = conn_from(b"stream until the end");
        let mut n = 0;
        copy_until_eof(&mut src, None, &mut n, 0).await.unwrap();
        assert_eq!(n, 20);
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size("1a").unwrap(), 26);
        assert_eq!(parse_chunk_size("0").unwrap(), 0);
        assert_eq!(parse_chunk_size("ff;name=v").unwrap(), 255);
        assert!(parse_chunk_size("").is_err());
        assert!(parse_chunk_size(";").is_err());
        assert!(parse_chunk_size("12 13").is_err());
    }
}
