//! 日志流中心
//!
//! 按执行ID把步骤事件扇出给当前所有订阅者。不做回放：订阅建立之前发布的事件
//! 对该订阅者永久丢失。每个订阅者拥有独立的有界缓冲区，缓冲区满时只丢弃发给
//! 该订阅者的事件，发布方永远不会被阻塞。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use jobs_core::StepEvent;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::metrics;

/// 默认订阅缓冲区大小
pub const DEFAULT_STREAM_BUFFER: usize = 256;

type SubscriberMap = HashMap<i64, HashMap<u64, mpsc::Sender<StepEvent>>>;

/// 日志流中心，克隆后共享同一份订阅表
#[derive(Clone)]
pub struct LogStreamHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    subscribers: RwLock<SubscriberMap>,
    next_subscriber_id: AtomicU64,
    buffer_size: usize,
}

impl HubInner {
    fn remove(&self, run_id: i64, subscriber_id: u64) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(run_subscribers) = subscribers.get_mut(&run_id) {
            run_subscribers.remove(&subscriber_id);
            if run_subscribers.is_empty() {
                subscribers.remove(&run_id);
            }
        }
    }
}

impl LogStreamHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    /// 订阅某次执行的事件流
    ///
    /// 同一执行可以有多个互相独立的订阅者。
    pub fn subscribe(&self, run_id: i64) -> LogSubscription {
        let (sender, receiver) = mpsc::channel(self.inner.buffer_size);
        let subscriber_id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(run_id)
            .or_default()
            .insert(subscriber_id, sender);

        debug!("订阅执行日志流: run_id={}, subscriber={}", run_id, subscriber_id);

        LogSubscription {
            run_id,
            receiver,
            handle: UnsubscribeHandle {
                hub: Arc::downgrade(&self.inner),
                run_id,
                subscriber_id,
                done: AtomicBool::new(false),
            },
        }
    }

    /// 尽力投递事件，不阻塞
    pub fn publish(&self, event: &StepEvent) {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(run_subscribers) = subscribers.get(&event.run_id) else {
            return;
        };

        for (subscriber_id, sender) in run_subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::record_stream_event_dropped();
                    trace!(
                        "订阅者缓冲区已满，丢弃事件: run_id={}, subscriber={}, type={}",
                        event.run_id,
                        subscriber_id,
                        event.kind.as_str()
                    );
                }
                // 接收端已丢弃但尚未退订，等待退订或 close 清理
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// 关闭某次执行的全部订阅者并移除，执行结束时调用一次
    pub fn close(&self, run_id: i64) {
        let removed = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id);

        if let Some(run_subscribers) = removed {
            debug!(
                "关闭执行日志流: run_id={}, 订阅者数量={}",
                run_id,
                run_subscribers.len()
            );
        }
    }

    pub fn subscriber_count(&self, run_id: i64) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
            .map_or(0, HashMap::len)
    }
}

impl Default for LogStreamHub {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER)
    }
}

/// 一个日志流订阅
///
/// 丢弃时自动退订。
pub struct LogSubscription {
    run_id: i64,
    receiver: mpsc::Receiver<StepEvent>,
    handle: UnsubscribeHandle,
}

impl LogSubscription {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// 接收下一个事件，流被关闭且缓冲区耗尽后返回 `None`
    pub async fn recv(&mut self) -> Option<StepEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StepEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }

    /// 拆分为接收端和退订句柄
    pub fn into_parts(self) -> (mpsc::Receiver<StepEvent>, UnsubscribeHandle) {
        (self.receiver, self.handle)
    }
}

/// 幂等的退订句柄，绑定到单个订阅者
pub struct UnsubscribeHandle {
    hub: Weak<HubInner>,
    run_id: i64,
    subscriber_id: u64,
    done: AtomicBool,
}

impl UnsubscribeHandle {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.run_id, self.subscriber_id);
        }
    }
}

impl Drop for UnsubscribeHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
