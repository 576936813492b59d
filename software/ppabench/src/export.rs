//! Two-column CSV export of a finished run

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::bench::{Mode, Sample};

/// Column names for the samples recorded in a given mode
pub fn csv_header(mode: Mode) -> [&'static str; 2] {
    match mode {
        Mode::SupplyTest => ["s", "A"],
        // A sink run is the default; an idle bench has nothing but the last sweep to export
        Mode::SinkTest | Mode::Idle => ["A", "V"],
    }
}

/// Write a header row followed by one row per sample
pub fn write_csv<W: Write>(writer: W, mode: Mode, samples: &[Sample]) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(csv_header(mode))?;
    for sample in samples {
        wtr.write_record(&[sample.x.to_string(), sample.y.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Create or overwrite `path` with the samples
pub fn save_csv(path: &Path, mode: Mode, samples: &[Sample]) -> Result<(), csv::Error> {
    let file = File::create(path)?;
    write_csv(file, mode, samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_export() {
        let samples = [Sample::new(0.0, 12.0), Sample::new(0.5, 11.75)];
        let mut buf = Vec::new();
        write_csv(&mut buf, Mode::SinkTest, &samples).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "A,V\n0,12\n0.5,11.75\n");
    }

    #[test]
    fn supply_export() {
        let samples = [Sample::new(0.5, 1.25)];
        let mut buf = Vec::new();
        write_csv(&mut buf, Mode::SupplyTest, &samples).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "s,A\n0.5,1.25\n");
    }

    #[test]
    fn empty_run_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        save_csv(&path, Mode::Idle, &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A,V\n");
    }
}
