use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::clock::Clock;

const NOTICE_TTL_SECS: i64 = 3600;

#[derive(Default)]
struct Board {
    messages: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
}

pub struct AdminNotices {
    board: Mutex<Board>,
    clock: Arc<dyn Clock>,
}

impl AdminNotices {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            board: Mutex::new(Board::default()),
            clock,
        }
    }

    pub async fn push(&self, message: impl Into<String>) {
        let message = message.into();
        let now = self.clock.now();
        let mut board = self.board.lock().await;
        expire(&mut board, now);
        warn!(notice = %message, "admin notice recorded");
        if !board.messages.contains(&message) {
            board.messages.push(message);
        }
        board.expires_at = Some(now + Duration::seconds(NOTICE_TTL_SECS));
    }

    pub async fn pending(&self) -> Vec<String> {
        let mut board = self.board.lock().await;
        expire(&mut board, self.clock.now());
        board.messages.clone()
    }

    pub async fn drain(&self) -> Vec<String> {
        let mut board = self.board.lock().await;
        expire(&mut board, self.clock.now());
        board.expires_at = None;
        std::mem::take(&mut board.messages)
    }
}

fn expire(board: &mut Board, now: DateTime<Utc>) {
    if board.expires_at.is_some_and(|at| at <= now) {
        board.messages.clear();
        board.expires_at = None;
    }
}
