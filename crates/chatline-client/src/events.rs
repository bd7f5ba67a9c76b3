use tokio::sync::broadcast;

/// What a user-visible notice is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    SendFailed,
    EditFailed,
    DeleteFailed,
    ReactionFailed,
    SettingsFailed,
    ContactNotFound,
}

/// Non-blocking notice surfaced to the UI when a primary-path operation
/// fails. The operation has already returned its error to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

/// Fan-out of [`Notice`]s to whichever views are listening.
#[derive(Debug, Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: NoticeKind, message: impl Into<String>) {
        let notice = Notice {
            kind,
            message: message.into(),
        };
        tracing::warn!(kind = ?notice.kind, message = %notice.message, "Notice");
        // no listener is not an error
        let _ = self.tx.send(notice);
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}
