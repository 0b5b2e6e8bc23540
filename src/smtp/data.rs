//! Streaming reader for the DATA section

use std::io::{self, BufRead, Read};

use crate::smtp::error::{SmtpError, SmtpLimits};

/// Yields message bytes up to, not including, the `.` terminator line.
///
/// Dot-stuffed lines are unstuffed. When a line or the whole message is over
/// the limits, the rest of the section is consumed and the reader reports one
/// `InvalidData` error; [`DataReader::violation`] tells which limit was hit.
pub struct DataReader<'a, R> {
    inner: &'a mut R,
    line: Vec<u8>,
    pos: usize,
    size: usize,
    finished: bool,
    reported: bool,
    violation: Option<SmtpError>,
}

impl<'a, R: BufRead> DataReader<'a, R> {
    pub fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            line: Vec::new(),
            pos: 0,
            size: 0,
            finished: false,
            reported: false,
            violation: None,
        }
    }

    /// Whether the terminator line (or end of input) has been reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Limit or framing problem found while reading, if any
    pub fn violation(&self) -> Option<&SmtpError> {
        self.violation.as_ref()
    }

    /// Bytes of message data accepted so far
    pub fn size(&self) -> usize {
        self.size
    }

    fn next_line(&mut self) -> io::Result<()> {
        self.pos = 0;
        loop {
            self.line.clear();
            let (read, overlong) = read_line_limited(
                &mut *self.inner,
                &mut self.line,
                SmtpLimits::TEXT_LINE_MAX_LENGTH,
            )?;
            if read == 0 {
                self.finished = true;
                self.violation.get_or_insert(SmtpError::ConnectionClosed);
                return Ok(());
            }

            if overlong {
                self.line.clear();
                self.violation.get_or_insert(SmtpError::LineTooLong {
                    max: SmtpLimits::TEXT_LINE_MAX_LENGTH,
                });
                continue;
            }

            let content = self
                .line
                .strip_suffix(b"\n")
                .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
                .unwrap_or(self.line.as_slice());
            if content == b"." {
                self.finished = true;
                self.line.clear();
                return Ok(());
            }

            if self.violation.is_some() {
                continue;
            }

            if self.line.starts_with(b"..") {
                self.line.remove(0);
            }
            if self.size + self.line.len() > SmtpLimits::MAX_DATA_SIZE {
                self.violation = Some(SmtpError::TooMuchData {
                    max: SmtpLimits::MAX_DATA_SIZE,
                });
                continue;
            }
            self.size += self.line.len();
            return Ok(());
        }
    }
}

/// Read one line into `buf`, keeping at most `max` bytes of it.
///
/// Returns the number of bytes taken from `reader` and whether the line was
/// longer than `max`. The rest of an overlong line is consumed up to and
/// including its newline without being stored.
pub(crate) fn read_line_limited<R: BufRead + ?Sized>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<(usize, bool)> {
    let mut read = (&mut *reader).take(max as u64).read_until(b'\n', buf)?;
    if read < max || buf.last() == Some(&b'\n') {
        return Ok((read, false));
    }

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok((read, true));
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok((read + end + 1, true));
            }
            None => {
                let len = available.len();
                reader.consume(len);
                read += len;
            }
        }
    }
}

impl<R: BufRead> Read for DataReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.line.len() {
            if self.finished {
                return match &self.violation {
                    Some(violation) if !self.reported => {
                        self.reported = true;
                        let kind = match violation {
                            SmtpError::ConnectionClosed => io::ErrorKind::UnexpectedEof,
                            _ => io::ErrorKind::InvalidData,
                        };
                        Err(io::Error::new(kind, violation.to_string()))
                    }
                    _ => Ok(0),
                };
            }
            self.next_line()?;
        }

        let n = buf.len().min(self.line.len() - self.pos);
        buf[..n].copy_from_slice(&self.line[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
