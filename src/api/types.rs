//! API request and response types.

use crate::memory::{MemoryCategory, Visibility};
use crate::scheduler::recurrence::{Recurrence, ScheduleType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    pub description: String,
    pub prompt: String,
    pub review_criteria: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DelegateResponse {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct NewMemoryRequest {
    pub category: MemoryCategory,
    pub content: String,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Deserialize)]
pub struct MemorySearchQuery {
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub hour: u32,
    pub minute: u32,
    #[serde(default)]
    pub weekdays: Vec<u8>,
    pub month_day: Option<u32>,
    pub interval_seconds: Option<i64>,
    pub run_date: Option<NaiveDate>,
    pub max_runs: Option<u32>,
}

impl CreateScheduleRequest {
    pub fn into_recurrence(self) -> Recurrence {
        Recurrence {
            schedule_type: self.schedule_type,
            hour: self.hour,
            minute: self.minute,
            weekdays: self.weekdays,
            month_day: self.month_day,
            interval_seconds: self.interval_seconds,
            run_date: self.run_date,
            first_fire_at: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StorageResponse {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}
