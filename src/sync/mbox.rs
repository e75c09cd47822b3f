//! mbox splitting.
//!
//! Records are separated by lines starting with `From `. Quoted separators
//! (`>From `, `>>From `, ...) lose one level of quoting. Input without any
//! separator line is returned as a single record.

use std::io::{self, BufRead};

pub struct MboxReader<R: BufRead> {
    reader: R,
    in_record: bool,
    done: bool,
}

impl<R: BufRead> MboxReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            in_record: false,
            done: false,
        }
    }

    fn read_record(&mut self) -> io::Result<Vec<u8>> {
        let mut record = Vec::new();
        loop {
            let mut line = Vec::new();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                self.done = true;
                break;
            }
            if line.starts_with(b"From ") {
                if self.in_record {
                    break;
                }
                self.in_record = true;
                continue;
            }
            self.in_record = true;
            if is_quoted_separator(&line) {
                record.extend_from_slice(&line[1..]);
            } else {
                record.extend_from_slice(&line);
            }
        }
        trim_trailing_blank_lines(&mut record);
        Ok(record)
    }
}

impl<R: BufRead> Iterator for MboxReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.read_record() {
                Ok(record) if record.iter().all(u8::is_ascii_whitespace) => continue,
                Ok(record) => return Some(Ok(record)),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

fn is_quoted_separator(line: &[u8]) -> bool {
    let unquoted = line.iter().position(|b| *b != b'>').unwrap_or(line.len());
    unquoted > 0 && line[unquoted..].starts_with(b"From ")
}

fn trim_trailing_blank_lines(record: &mut Vec<u8>) {
    while record.ends_with(b"\r\n\r\n") {
        record.truncate(record.len() - 2);
    }
    while record.ends_with(b"\n\n") {
        record.pop();
    }
}

/// Split an in-memory mbox into raw messages.
pub fn split_mbox(data: &[u8]) -> Vec<Vec<u8>> {
    MboxReader::new(data).filter_map(Result::ok).collect()
}
