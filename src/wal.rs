use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// One committed transaction: every event in it replays, or none does.
pub type Frame = Vec<Event>;

fn encode_frame(writer: &mut impl Write, frame: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only write-ahead log of schedule transactions.
///
/// Entry layout: `[u32: len][bincode: Vec<Event>][u32: crc32]`. A torn or
/// corrupt trailing frame ends replay; the transaction it carried is lost as a
/// whole, which is what keeps a booking's slot reservation and appointment
/// insert together.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, frame: &[Event]) -> io::Result<()> {
        self.append_buffered(frame)?;
        self.flush_sync()
    }

    /// Buffer a frame without syncing. `flush_sync` makes the batch durable.
    pub fn append_buffered(&mut self, frame: &[Event]) -> io::Result<()> {
        encode_frame(&mut self.writer, frame)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a sibling temp file. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, snapshot: &[Frame]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for frame in snapshot {
            encode_frame(&mut writer, frame)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Frame]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact frame. Stops silently at the first truncated or
    /// corrupt one.
    pub fn replay(path: &Path) -> io::Result<Vec<Frame>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut frames = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            if !read_or_eof(&mut reader, &mut len_buf)? {
                break;
            }
            let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            if !read_or_eof(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_or_eof(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<Frame>(&payload) {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }

        Ok(frames)
    }
}

/// `Ok(false)` on a short read at end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn schedule_created(total: u32) -> Event {
        Event::ScheduleCreated(Schedule {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            department_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 5, 4).unwrap(),
            period: Period::Morning,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            total_slots: total,
            available_slots: total,
            enabled: true,
        })
    }

    #[test]
    fn append_and_replay_frames() {
        let path = tmp_path("append_and_replay.wal");
        let created = schedule_created(3);
        let sid = created.schedule_id();
        let frames = vec![
            vec![created],
            vec![
                Event::SlotReserved { schedule_id: sid },
                Event::AppointmentMissed { id: Ulid::new(), schedule_id: sid },
            ],
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for f in &frames {
                wal.append(f).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), frames);
    }

    #[test]
    fn torn_frame_is_dropped_whole() {
        let path = tmp_path("torn.wal");
        let first = vec![schedule_created(1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let frame: Frame = vec![Event::ScheduleDeleted { id: Ulid::new() }];
        {
            let payload = bincode::serialize(&frame).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let created = schedule_created(2);
        let sid = created.schedule_id();
        let snapshot = vec![vec![created.clone()]];
        let later = vec![Event::SlotReserved { schedule_id: sid }];

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..5 {
                wal.append(&[created.clone()]).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
    }
}
