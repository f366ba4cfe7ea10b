use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Appointment, Event, Period, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// One committed transaction on a schedule, as seen by listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleChange {
    pub schedule_id: Ulid,
    pub events: Vec<Event>,
    /// `available_slots` right after the commit.
    pub available_slots: u32,
}

/// Broadcast hub for per-schedule change feeds.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ScheduleChange>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a schedule's changes. Creates the channel if needed.
    pub fn subscribe(&self, schedule_id: Ulid) -> broadcast::Receiver<ScheduleChange> {
        let sender = self
            .channels
            .entry(schedule_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a committed transaction. No-op if nobody is listening.
    pub fn send(&self, schedule_id: Ulid, events: &[Event], available_slots: u32) {
        if let Some(sender) = self.channels.get(&schedule_id) {
            let _ = sender.send(ScheduleChange {
                schedule_id,
                events: events.to_vec(),
                available_slots,
            });
        }
    }

    /// Drop a schedule's channel (e.g. after it is deleted).
    pub fn remove(&self, schedule_id: &Ulid) {
        self.channels.remove(schedule_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ── Reminders ────────────────────────────────────────────

/// Next-day visit reminder handed to an outbound channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reminder {
    pub appointment_id: Ulid,
    pub appointment_no: String,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub period: Period,
    pub time: NaiveTime,
    pub slot_number: u32,
}

impl From<&Appointment> for Reminder {
    fn from(a: &Appointment) -> Self {
        Self {
            appointment_id: a.id,
            appointment_no: a.appointment_no.clone(),
            user_id: a.user_id,
            date: a.date,
            period: a.period,
            time: a.time,
            slot_number: a.slot_number,
        }
    }
}

/// Outbound notification channel (SMS, push, mail...).
#[async_trait]
pub trait ReminderDispatcher: Send + Sync {
    async fn dispatch(&self, reminder: &Reminder) -> Result<(), String>;
}

/// Writes each reminder as a JSON log line. Default when no channel is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl ReminderDispatcher for LogDispatcher {
    async fn dispatch(&self, reminder: &Reminder) -> Result<(), String> {
        let payload = serde_json::to_string(reminder).map_err(|e| e.to_string())?;
        tracing::info!(target: "slotbook::reminder", "{payload}");
        Ok(())
    }
}
