use crate::utils::logs;
use strum::Display;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NoticeAction {
    #[strum(serialize = "sign-in")]
    SignIn,
    #[strum(serialize = "retry")]
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub action: Option<NoticeAction>,
}

/// Sender side of the toast queue. Pushing never blocks and never fails; a
/// notice with nobody listening is only logged.
#[derive(Clone, Debug)]
pub struct Notices {
    tx: UnboundedSender<Notice>,
}

impl Notices {
    pub fn channel() -> (Self, UnboundedReceiver<Notice>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, notice: Notice) {
        logs::log_notice(&notice);
        let _ = self.tx.send(notice);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(Notice {
            level: NoticeLevel::Info,
            message: message.into(),
            action: None,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Notice {
            level: NoticeLevel::Error,
            message: message.into(),
            action: Some(NoticeAction::Retry),
        });
    }

    pub fn sign_in_required(&self, message: impl Into<String>) {
        self.push(Notice {
            level: NoticeLevel::Error,
            message: message.into(),
            action: Some(NoticeAction::SignIn),
        });
    }
}
