use std::fmt;

use tokio::sync::watch;

/// Broker lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl State {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Starting => "starting",
            State::Running => "running",
            State::Draining => "draining",
            State::Stopped => "stopped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Lifecycle {
    tx: watch::Sender<State>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    #[inline]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(State::Starting);
        Self { tx }
    }

    #[inline]
    pub fn state(&self) -> State {
        *self.tx.borrow()
    }

    /// Moves to `to` if that is a step forward. Returns whether the state changed.
    pub fn transition(&self, to: State) -> bool {
        let changed = self.tx.send_if_modified(|s| {
            if to > *s {
                *s = to;
                true
            } else {
                false
            }
        });
        if changed {
            log::info!("broker is {}", to);
        }
        changed
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.state() >= State::Draining
    }

    /// Resolves once the broker has reached `state` or gone past it.
    pub fn reached(&self, state: State) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx.wait_for(|s| *s >= state).await;
        }
    }

    /// Resolves once draining has begun.
    #[inline]
    pub fn draining(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.reached(State::Draining)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn forward_only() {
        let l = Lifecycle::new();
        assert_eq!(l.state(), State::Starting);
        assert!(l.transition(State::Running));
        assert!(!l.transition(State::Starting));
        assert!(l.transition(State::Draining));
        assert!(!l.transition(State::Running));
        assert!(l.is_draining());
        assert!(l.transition(State::Stopped));
        assert!(l.is_draining());
    }

    #[tokio::test]
    async fn draining_future_resolves() {
        let l = Lifecycle::new();
        let fut = l.draining();
        l.transition(State::Running);
        assert!(tokio::time::timeout(Duration::from_millis(50), l.draining()).await.is_err());
        l.transition(State::Draining);
        tokio::time::timeout(Duration::from_secs(1), fut).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), l.draining()).await.unwrap();
    }
}
