use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

/// Default cap on a single raw line. Chat content is limited to 1 KiB at the
/// protocol layer; anything past this cap is a misbehaving client and the
/// read fails instead of buffering without bound.
pub const DEFAULT_MAX_LINE_LEN: usize = 8 * 1024;

#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line_len: usize,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(DEFAULT_MAX_LINE_LEN),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    pub fn max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max.max(1);
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Read one line, stripping the trailing `\n` and an optional `\r`.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` for a line (may be empty),
    /// - `Ok(None)` on clean EOF with no buffered data.
    pub async fn read_line(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(i) = memchr(b'\n', &self.buf) {
                let raw = self.buf.split_to(i + 1).freeze();
                return Ok(Some(trim_crlf(raw)));
            }

            if self.buf.len() > self.max_line_len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading line",
                ));
            }
        }
    }

    /// Like [`read_line`](Self::read_line) but lossily decoded to `String`.
    /// Client input is expected to be UTF-8; stray bytes become U+FFFD.
    pub async fn read_line_utf8(&mut self) -> std::io::Result<Option<String>> {
        Ok(self
            .read_line()
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }
}

fn trim_crlf(mut b: Bytes) -> Bytes {
    let mut end = b.len();
    if end > 0 && b[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && b[end - 1] == b'\r' {
        end -= 1;
    }
    b.truncate(end);
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_crlf_and_lf() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"hello\r\nworld\n").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        let l1 = lr.read_line().await.unwrap().unwrap();
        let l2 = lr.read_line().await.unwrap().unwrap();
        assert_eq!(&l1[..], b"hello");
        assert_eq!(&l2[..], b"world");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_lines_are_lines() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"\n\r\nx\n").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        assert_eq!(&lr.read_line().await.unwrap().unwrap()[..], b"");
        assert_eq!(&lr.read_line().await.unwrap().unwrap()[..], b"");
        assert_eq!(&lr.read_line().await.unwrap().unwrap()[..], b"x");
    }

    #[tokio::test]
    async fn overlong_line_fails() {
        let (a, b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(&[b'x'; 600]).await.unwrap();
            b.write_all(b"\n").await.unwrap();
        });

        let mut lr = LineReader::new(a).max_line_len(16);
        let err = lr.read_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_mid_line_is_an_error() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"no newline").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        let err = lr.read_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn lossy_utf8_decode() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"caf\xc3\xa9\r\n").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        assert_eq!(lr.read_line_utf8().await.unwrap().unwrap(), "café");
    }
}
