use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
};

use chrono::{DateTime, Local};
use env_logger::{Builder, Env, Target};
use log::debug;
use xfer_error::Result;

/// `benchmark_YYYYmmdd_HHMMSS.log`
pub fn log_file_name(now: DateTime<Local>) -> String {
    format!("benchmark_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Installs the process logger. `RUST_LOG` overrides the default `info`
/// filter. With `log_dir`, every line also goes to a timestamped file in
/// that directory, whose path is returned.
///
/// A logger that is already installed is left in place.
pub fn init(log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let mut builder =
        Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        let current = thread::current();
        writeln!(
            buf,
            "{} - {} - {} - {}",
            buf.timestamp_millis(),
            current.name().unwrap_or("unnamed"),
            record.level(),
            record.args()
        )
    });

    let log_file = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(log_file_name(Local::now()));
            let file = File::create(&path)?;
            builder.target(Target::Pipe(Box::new(Tee { file })));
            Some(path)
        }
        None => None,
    };

    if builder.try_init().is_err() {
        debug!("Logger already installed");
    }
    Ok(log_file)
}

/// Duplicates log output to stderr and a file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempdir::TempDir;

    #[test]
    fn file_name_embeds_local_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(log_file_name(now), "benchmark_20240307_090501.log");
    }

    #[test]
    fn creates_log_file_and_tolerates_reinit() {
        let dir = TempDir::new("xfer-logs").unwrap();
        let path = init(Some(dir.path())).unwrap().unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path()));

        assert!(init(None).unwrap().is_none());
    }
}
