//! 日志流心跳适配
//!
//! 把订阅包装为事件流：首先产出 `connected`，之后转发执行事件，并在空闲时
//! 按固定间隔产出 `heartbeat` 保持长连接。收到 `complete` 或流被关闭后结束。

use std::time::Duration;

use futures::stream::{self, Stream};
use jobs_core::StepEvent;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::stream_hub::LogSubscription;

/// 默认心跳间隔
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

enum Stage {
    Connect,
    Streaming,
    Done,
}

struct HeartbeatState {
    subscription: LogSubscription,
    ticker: Interval,
    stage: Stage,
}

pub fn with_heartbeat(
    subscription: LogSubscription,
    period: Duration,
) -> impl Stream<Item = StepEvent> + Send {
    let period = period.max(Duration::from_millis(1));
    let run_id = subscription.run_id();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = HeartbeatState {
        subscription,
        ticker,
        stage: Stage::Connect,
    };

    stream::unfold(state, move |mut state| async move {
        match state.stage {
            Stage::Connect => {
                state.stage = Stage::Streaming;
                Some((StepEvent::connected(run_id), state))
            }
            Stage::Done => None,
            Stage::Streaming => {
                tokio::select! {
                    biased;
                    event = state.subscription.recv() => {
                        let event = event?;
                        if event.is_terminal() {
                            state.stage = Stage::Done;
                        }
                        Some((event, state))
                    }
                    _ = state.ticker.tick() => Some((StepEvent::heartbeat(run_id), state)),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_hub::LogStreamHub;
    use futures::StreamExt;
    use jobs_core::models::{JobStep, RunStatus};
    use jobs_core::StepEventKind;

    #[tokio::test(start_paused = true)]
    async fn test_connected_then_heartbeats() {
        let hub = LogStreamHub::new(8);
        let stream = with_heartbeat(hub.subscribe(1), Duration::from_secs(15));
        futures::pin_mut!(stream);

        assert_eq!(stream.next().await.unwrap().kind, StepEventKind::Connected);
        let started = Instant::now();
        let heartbeat = stream.next().await.unwrap();
        assert_eq!(heartbeat.kind, StepEventKind::Heartbeat);
        assert_eq!(heartbeat.run_id, 1);
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_forwards_events_and_ends_after_complete() {
        let hub = LogStreamHub::new(8);
        let stream = with_heartbeat(hub.subscribe(2), Duration::from_secs(60));
        futures::pin_mut!(stream);
        assert_eq!(stream.next().await.unwrap().kind, StepEventKind::Connected);

        hub.publish(&StepEvent::step_log(&JobStep::running(2, 1, "a"), "line"));
        hub.publish(&StepEvent::complete(2, RunStatus::Success, "ok"));

        assert_eq!(stream.next().await.unwrap().kind, StepEventKind::StepLog);
        assert_eq!(stream.next().await.unwrap().kind, StepEventKind::Complete);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ends_when_hub_closes() {
        let hub = LogStreamHub::new(8);
        let stream = with_heartbeat(hub.subscribe(3), Duration::from_secs(60));
        futures::pin_mut!(stream);
        assert_eq!(stream.next().await.unwrap().kind, StepEventKind::Connected);

        hub.close(3);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let hub = LogStreamHub::new(8);
        let stream = with_heartbeat(hub.subscribe(4), Duration::from_secs(60));
        assert_eq!(hub.subscriber_count(4), 1);
        drop(stream);
        assert_eq!(hub.subscriber_count(4), 0);
    }
}
