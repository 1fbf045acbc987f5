use std::{
    collections::HashMap,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use fs4::tokio::AsyncFileExt;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, warn};

use crate::utils::clock::Clock;

use super::entities::{
    NotifyFreq, ProgressSnapshot, TimeRecordEntity, UserId, UserProfileEntity,
};

/// Interface for abstracting persistence of user profiles and time records.
pub trait TimeLedger {
    fn user_exists(&self, user: UserId) -> impl Future<Output = Result<bool>> + Send;

    fn get_profile(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Option<UserProfileEntity>>> + Send;

    /// Creates the profile or overwrites rate/goal/notify of an existing one. Accumulated
    /// earnings of an existing profile are preserved.
    fn upsert_profile(
        &self,
        user: UserId,
        profile: UserProfileEntity,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update_rate(&self, user: UserId, rate: f64) -> impl Future<Output = Result<()>> + Send;

    fn update_goal(&self, user: UserId, goal: f64) -> impl Future<Output = Result<()>> + Send;

    fn update_notify(
        &self,
        user: UserId,
        freq: NotifyFreq,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Appends a time record and bumps the cumulative earnings of the user.
    /// Returns the earnings computed for this record.
    fn add_time_record(
        &self,
        user: UserId,
        minutes: u32,
    ) -> impl Future<Output = Result<f64>> + Send;

    /// Returns up to `limit` records, newest first.
    fn history(
        &self,
        user: UserId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TimeRecordEntity>>> + Send;

    fn total_minutes(&self, user: UserId) -> impl Future<Output = Result<u64>> + Send;

    /// Drops all time records of the user and zeroes the earned counter. Rate, goal and
    /// notification settings stay.
    fn reset_progress(&self, user: UserId) -> impl Future<Output = Result<()>> + Send;

    fn progress(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Option<ProgressSnapshot>>> + Send;

    /// Every stored profile, used to restore notification schedules on startup.
    fn all_profiles(
        &self,
    ) -> impl Future<Output = Result<Vec<(UserId, UserProfileEntity)>>> + Send;
}

/// The main realization of [TimeLedger].
pub struct TimeLedgerImpl {
    profiles_path: PathBuf,
    record_dir: PathBuf,
    clock: Box<dyn Clock>,
}

impl TimeLedgerImpl {
    pub fn new(dir: &Path, clock: Box<dyn Clock>) -> Result<Self, std::io::Error> {
        let record_dir = dir.join("records");
        std::fs::create_dir_all(&record_dir)?;

        Ok(Self {
            profiles_path: dir.join("profiles.json"),
            record_dir,
            clock,
        })
    }

    fn record_path(&self, user: UserId) -> PathBuf {
        self.record_dir.join(format!("{user}.jsonl"))
    }

    async fn load_profiles(&self) -> Result<HashMap<UserId, UserProfileEntity>> {
        let file = match File::open(&self.profiles_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut file = file;
        let mut contents = String::new();
        let read_result = file.read_to_string(&mut contents).await;
        file.unlock_async().await?;
        read_result?;

        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    async fn store_profiles(&self, profiles: &HashMap<UserId, UserProfileEntity>) -> Result<()> {
        let mut file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.profiles_path)
            .await?;
        file.lock_exclusive()?;
        let result = async {
            file.write_all(&serde_json::to_vec(profiles)?).await?;
            file.flush().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        file.unlock_async().await?;
        result
    }

    async fn change_profile(
        &self,
        user: UserId,
        change: impl FnOnce(&mut UserProfileEntity),
    ) -> Result<()> {
        let mut profiles = self.load_profiles().await?;
        let profile = profiles
            .get_mut(&user)
            .ok_or_else(|| anyhow!("User {user} is not registered"))?;
        change(profile);
        self.store_profiles(&profiles).await
    }

    async fn read_records(&self, user: UserId) -> Result<Vec<TimeRecordEntity>> {
        let path = self.record_path(user);
        let file = match File::open(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        debug!("Extracting {path:?}");
        file.lock_shared()?;
        let buffer = BufReader::new(file);
        let mut lines = buffer.lines();
        let mut records = vec![];
        while let Ok(Some(v)) = lines.next_line().await {
            match serde_json::from_str::<TimeRecordEntity>(&v) {
                Ok(v) => records.push(v),
                Err(e) => {
                    // ignore illegal values. Might happen after shutdowns
                    warn!(
                        "During parsing in path {:?} found illegal json string {}:  {e}",
                        path, &v
                    )
                }
            }
        }
        lines.into_inner().into_inner().unlock_async().await?;

        Ok(records)
    }

    async fn append_record(&self, user: UserId, record: &TimeRecordEntity) -> Result<()> {
        let mut file = File::options()
            .append(true)
            .create(true)
            .open(self.record_path(user))
            .await?;
        file.lock_exclusive()?;
        let result = async {
            let mut buffer = serde_json::to_vec(record)?;
            buffer.push(b'\n');
            file.write_all(&buffer).await?;
            file.flush().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        file.unlock_async().await?;
        result
    }
}

impl TimeLedger for TimeLedgerImpl {
    async fn user_exists(&self, user: UserId) -> Result<bool> {
        Ok(self.load_profiles().await?.contains_key(&user))
    }

    async fn get_profile(&self, user: UserId) -> Result<Option<UserProfileEntity>> {
        Ok(self.load_profiles().await?.remove(&user))
    }

    async fn upsert_profile(&self, user: UserId, profile: UserProfileEntity) -> Result<()> {
        let mut profiles = self.load_profiles().await?;
        let earned = profiles.get(&user).map(|v| v.earned).unwrap_or(0.);
        profiles.insert(user, UserProfileEntity { earned, ..profile });
        self.store_profiles(&profiles).await
    }

    async fn update_rate(&self, user: UserId, rate: f64) -> Result<()> {
        self.change_profile(user, |p| p.rate = rate).await
    }

    async fn update_goal(&self, user: UserId, goal: f64) -> Result<()> {
        self.change_profile(user, |p| p.goal = goal).await
    }

    async fn update_notify(&self, user: UserId, freq: NotifyFreq) -> Result<()> {
        self.change_profile(user, |p| p.notify = freq).await
    }

    async fn add_time_record(&self, user: UserId, minutes: u32) -> Result<f64> {
        let mut profiles = self.load_profiles().await?;
        let profile = profiles
            .get_mut(&user)
            .ok_or_else(|| anyhow!("User {user} is not registered"))?;

        let earnings = (minutes as f64 / 60.) * profile.rate;
        let record = TimeRecordEntity {
            minutes,
            earnings,
            logged_at: self.clock.time(),
        };

        // The counter goes first. Failing here leaves no record behind, so a retry
        // can't double-count the time.
        let previous_earned = profile.earned;
        profile.earned += earnings;
        self.store_profiles(&profiles).await?;

        if let Err(e) = self.append_record(user, &record).await {
            if let Some(profile) = profiles.get_mut(&user) {
                profile.earned = previous_earned;
            }
            if let Err(rollback) = self.store_profiles(&profiles).await {
                warn!("Couldn't roll back earnings of user {user} after a failed append: {rollback:?}");
            }
            return Err(e);
        }

        Ok(earnings)
    }

    async fn history(&self, user: UserId, limit: usize) -> Result<Vec<TimeRecordEntity>> {
        let mut records = self.read_records(user).await?;
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
        records.reverse();
        Ok(records)
    }

    async fn total_minutes(&self, user: UserId) -> Result<u64> {
        let records = self.read_records(user).await?;
        Ok(records.iter().map(|v| v.minutes as u64).sum())
    }

    async fn reset_progress(&self, user: UserId) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(user)).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.change_profile(user, |p| p.earned = 0.).await
    }

    async fn progress(&self, user: UserId) -> Result<Option<ProgressSnapshot>> {
        Ok(self.get_profile(user).await?.map(|v| v.progress()))
    }

    async fn all_profiles(&self) -> Result<Vec<(UserId, UserProfileEntity)>> {
        Ok(self.load_profiles().await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        storage::{
            entities::{NotifyFreq, UserProfileEntity},
            ledger::{TimeLedger, TimeLedgerImpl},
        },
        utils::clock::Clock,
    };

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(), NaiveTime::MIN);

    struct TestClock;

    #[async_trait]
    impl Clock for TestClock {
        fn time(&self) -> DateTime<Utc> {
            Utc.from_utc_datetime(&TEST_START_DATE)
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }
    }

    fn test_profile(rate: f64, goal: f64) -> UserProfileEntity {
        UserProfileEntity {
            rate,
            goal,
            earned: 0.,
            notify: NotifyFreq::Day,
        }
    }

    #[tokio::test]
    async fn test_register_and_add_record() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        assert!(!ledger.user_exists(1).await?);
        ledger.upsert_profile(1, test_profile(500., 10000.)).await?;
        assert!(ledger.user_exists(1).await?);

        let earnings = ledger.add_time_record(1, 90).await?;
        assert_eq!(earnings, 750.);

        let profile = ledger.get_profile(1).await?.unwrap();
        assert_eq!(profile.earned, 750.);

        let history = ledger.history(1, 10).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].minutes, 90);
        assert_eq!(ledger.total_minutes(1).await?, 90);

        Ok(())
    }

    #[tokio::test]
    async fn test_add_record_requires_profile() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        assert!(ledger.add_time_record(7, 30).await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_limited() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        ledger.upsert_profile(1, test_profile(600., 10000.)).await?;
        ledger.add_time_record(1, 10).await?;
        ledger.add_time_record(1, 20).await?;
        ledger.add_time_record(1, 30).await?;

        let history = ledger.history(1, 2).await?;
        assert_eq!(
            history.iter().map(|v| v.minutes).collect::<Vec<_>>(),
            vec![30, 20]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_preserves_earned() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        ledger.upsert_profile(1, test_profile(500., 10000.)).await?;
        ledger.add_time_record(1, 60).await?;

        ledger.upsert_profile(1, test_profile(700., 20000.)).await?;
        let profile = ledger.get_profile(1).await?.unwrap();
        assert_eq!(profile.rate, 700.);
        assert_eq!(profile.goal, 20000.);
        assert_eq!(profile.earned, 500.);

        Ok(())
    }

    #[tokio::test]
    async fn test_reset_keeps_profile_settings() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        ledger.upsert_profile(1, test_profile(500., 10000.)).await?;
        ledger.add_time_record(1, 120).await?;

        ledger.reset_progress(1).await?;

        let profile = ledger.get_profile(1).await?.unwrap();
        assert_eq!(profile.earned, 0.);
        assert_eq!(profile.rate, 500.);
        assert!(ledger.history(1, 10).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_record_append_leaves_earnings_unchanged() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        ledger.upsert_profile(1, test_profile(500., 10000.)).await?;

        // A directory in place of the record file makes the append fail.
        std::fs::create_dir(dir.path().join("records").join("1.jsonl"))?;

        assert!(ledger.add_time_record(1, 60).await.is_err());
        let profile = ledger.get_profile(1).await?.unwrap();
        assert_eq!(profile.earned, 0.);

        Ok(())
    }

    #[tokio::test]
    async fn test_progress_is_clamped() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        ledger.upsert_profile(1, test_profile(500., 1000.)).await?;
        ledger.add_time_record(1, 60).await?;

        let progress = ledger.progress(1).await?.unwrap();
        assert_eq!(progress.percent, 50);
        assert_eq!(progress.hours_left, 1.);

        ledger.add_time_record(1, 120).await?;
        let progress = ledger.progress(1).await?.unwrap();
        assert_eq!(progress.percent, 100);
        assert_eq!(progress.hours_left, 0.);

        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_record_lines_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let ledger = TimeLedgerImpl::new(dir.path(), Box::new(TestClock))?;

        ledger.upsert_profile(1, test_profile(500., 10000.)).await?;
        ledger.add_time_record(1, 15).await?;

        // Simulates a write cut off by a shutdown.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("records").join("1.jsonl"))?;
        file.write_all(b"{\"minutes\": 3")?;
        drop(file);

        let history = ledger.history(1, 10).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].minutes, 15);

        Ok(())
    }
}
