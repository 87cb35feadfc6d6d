//! Reading program log files: the tail returned by the supervising process and the
//! follow loop run by `logs --follow`.
use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use crate::constants::FOLLOW_POLL_INTERVAL;

/// Returns the last `lines` lines of the file, or all of them for `None`.
///
/// A missing file yields no lines.
pub fn tail_lines(path: &Path, lines: Option<usize>) -> io::Result<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut kept = VecDeque::new();
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => continue,
            Err(err) => return Err(err),
        };
        kept.push_back(line);
        if let Some(limit) = lines
            && kept.len() > limit
        {
            kept.pop_front();
        }
    }
    Ok(kept.into())
}

/// Parses a `--tail` value: a number, or `all`.
pub fn parse_tail(raw: &str) -> Result<Option<usize>, String> {
    if raw.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    raw.parse::<usize>()
        .map(Some)
        .map_err(|_| format!("invalid tail value '{raw}', expected a number or 'all'"))
}

/// Copies bytes appended to `path` into `out` until `running` is cleared.
///
/// Starts at the current end of the file and rewinds when the file is truncated.
pub fn follow(path: &Path, out: &mut impl Write, running: &AtomicBool) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut position = file.seek(SeekFrom::End(0))?;
    let mut buffer = Vec::new();

    while running.load(Ordering::SeqCst) {
        let len = file.metadata()?.len();
        if len < position {
            position = file.seek(SeekFrom::Start(0))?;
        }
        if len > position {
            buffer.clear();
            let read = (&mut file).take(len - position).read_to_end(&mut buffer)?;
            position += read as u64;
            out.write_all(&buffer)?;
            out.flush()?;
        }
        thread::sleep(FOLLOW_POLL_INTERVAL);
    }
    Ok(())
}
