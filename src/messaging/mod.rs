//! 进程内发布/订阅消息枢纽
//!
//! 监督运行时只依赖这里的 `PubMaster` / `SubSocket` / `SubMaster` 和
//! 消息类型本身，换掉底下的传输实现不需要动核心逻辑。当前实现用
//! crossbeam 有界通道做扇出，慢订阅者丢最新帧而不是阻塞发布方。
//!
//! 每条消息带单调时钟戳（`log_mono_time`，纳秒），跨线程可直接比较。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Select, Sender, bounded};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

use crate::board::types::{
    FaultKind, FaultStatus, HarnessStatus, HwType, SafetyModel, UsbPowerMode,
};
use crate::timeutil::nanos_since_boot;

pub mod codec;

pub use codec::CanFrame;

/// 单个订阅通道的缓冲深度
const CHANNEL_DEPTH: usize = 128;

/// 板卡状态报文（`pandaState` 通道）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PandaStateMsg {
    /// 发布时板卡通信是否健康
    pub valid: bool,
    pub uptime: u32,
    pub voltage: u32,
    pub current: u32,
    /// 推导后的点火状态
    pub ignition_line: bool,
    pub ignition_can: bool,
    pub controls_allowed: bool,
    pub gas_interceptor_detected: bool,
    pub has_gps: bool,
    pub can_rx_errs: u32,
    pub can_send_errs: u32,
    pub can_fwd_errs: u32,
    pub gmlan_send_errs: u32,
    pub panda_type: HwType,
    pub usb_power_mode: UsbPowerMode,
    pub safety_model: SafetyModel,
    pub safety_param: i16,
    pub fan_speed_rpm: u16,
    pub fault_status: FaultStatus,
    pub power_save_enabled: bool,
    pub heartbeat_lost: bool,
    pub harness_status: HarnessStatus,
    /// 激活故障列表（按故障种类升序）
    pub faults: Vec<FaultKind>,
}

/// 设备状态报文（`deviceState` 通道，本进程只消费）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStateMsg {
    pub charging_disabled: bool,
    pub fan_speed_percent_desired: u16,
}

/// 驾驶员摄像头状态报文（`driverCameraState` 通道，本进程只消费）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverCameraStateMsg {
    /// 曝光积分行数，红外补光控制的输入
    pub integ_lines: i32,
}

/// 通道负载
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// CAN 批量字节（编码格式见 [`codec`]，本进程不解析）
    Can(Bytes),
    /// 待下发的 CAN 帧批
    SendCan(Vec<CanFrame>),
    PandaState(PandaStateMsg),
    /// u-blox 原始字节流
    UbloxRaw(Bytes),
    DeviceState(DeviceStateMsg),
    DriverCameraState(DriverCameraStateMsg),
}

/// 一条带时间戳的消息
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// 发布时刻的单调纳秒
    pub log_mono_time: u64,
    pub payload: Payload,
}

/// 订阅接收错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecvError {
    /// 超时内没有消息（正常情况，继续轮询即可）
    #[error("Receive timeout")]
    Timeout,

    /// 收到中断信号（等价于 EINTR，按停机处理）
    #[error("Receive interrupted")]
    Interrupted,

    /// 通道已关闭
    #[error("Channel closed")]
    Closed,
}

/// 消息枢纽
///
/// 发布方和订阅方都从同一个枢纽实例拿句柄。`interrupt()` 用于停机：
/// 之后所有阻塞接收都会在一个超时片内返回 `Interrupted`。
pub struct MessageHub {
    topics: RwLock<HashMap<&'static str, Vec<Sender<Message>>>>,
    interrupted: Arc<AtomicBool>,
}

impl MessageHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 订阅一个通道
    pub fn subscribe(&self, topic: &'static str) -> SubSocket {
        let (tx, rx) = bounded(CHANNEL_DEPTH);
        self.topics.write().entry(topic).or_default().push(tx);
        SubSocket {
            rx,
            timeout: Duration::from_millis(100),
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    /// 发布一条消息
    ///
    /// 订阅者缓冲满时丢弃该订阅者的这条消息（发布路径永不阻塞），
    /// 已断开的订阅者顺手清理。
    pub fn publish(&self, topic: &str, msg: Message) {
        let mut topics = self.topics.write();
        let Some(senders) = topics.get_mut(topic) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                trace!("subscriber on '{topic}' is full, dropping message");
                true
            },
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }

    /// 中断所有阻塞中的接收（停机用，对应信号语义）
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// 是否已进入中断状态
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// 发布句柄（可同时持有多个通道）
pub struct PubMaster {
    hub: Arc<MessageHub>,
    topics: Vec<&'static str>,
}

impl PubMaster {
    /// 创建发布句柄，声明要发布的通道
    pub fn new(hub: Arc<MessageHub>, topics: &[&'static str]) -> Self {
        Self {
            hub,
            topics: topics.to_vec(),
        }
    }

    /// 发布负载，时间戳取当前单调时钟
    ///
    /// # Panics
    /// 向未声明的通道发布属于编程错误，直接 panic。
    pub fn send(&self, topic: &'static str, payload: Payload) {
        assert!(
            self.topics.contains(&topic),
            "publishing to undeclared topic '{topic}'"
        );
        self.hub.publish(
            topic,
            Message {
                log_mono_time: nanos_since_boot(),
                payload,
            },
        );
    }
}

/// 单通道阻塞订阅句柄
pub struct SubSocket {
    rx: Receiver<Message>,
    timeout: Duration,
    interrupted: Arc<AtomicBool>,
}

impl SubSocket {
    /// 设置后续 `receive()` 的超时
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// 阻塞接收一条消息
    ///
    /// # 返回
    /// - `Ok(msg)`: 收到消息
    /// - `Err(Timeout)`: 超时内无消息
    /// - `Err(Interrupted)`: 枢纽已被中断（停机）
    /// - `Err(Closed)`: 发布端全部消失
    pub fn receive(&self) -> Result<Message, RecvError> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(RecvError::Interrupted);
        }
        match self.rx.recv_timeout(self.timeout) {
            Ok(msg) => Ok(msg),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if self.interrupted.load(Ordering::SeqCst) {
                    Err(RecvError::Interrupted)
                } else {
                    Err(RecvError::Timeout)
                }
            },
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(RecvError::Closed),
        }
    }

    /// 非阻塞接收
    pub fn try_receive(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// 多通道订阅句柄
///
/// 维护每个通道的最新消息和「本轮是否更新」标记，对应硬件控制环路的
/// 消费模式：一次 `update()`，然后按通道查询。
pub struct SubMaster {
    sockets: Vec<(&'static str, SubSocket)>,
    latest: HashMap<&'static str, Message>,
    updated: HashMap<&'static str, bool>,
}

impl SubMaster {
    pub fn new(hub: &Arc<MessageHub>, topics: &[&'static str]) -> Self {
        let sockets = topics.iter().map(|&t| (t, hub.subscribe(t))).collect();
        Self {
            sockets,
            latest: HashMap::new(),
            updated: topics.iter().map(|t| (*t, false)).collect(),
        }
    }

    /// 等待任意通道来新消息，最多阻塞 `timeout`
    ///
    /// 返回后用 [`SubMaster::updated`] 查询哪些通道在本轮收到了消息。
    /// 一轮内同一通道的多条消息只保留最新一条。
    pub fn update(&mut self, timeout: Duration) {
        for flag in self.updated.values_mut() {
            *flag = false;
        }

        // 先把积压的消息全部清空
        if self.drain() {
            return;
        }

        // 没有积压时阻塞等第一条
        let first = {
            let mut sel = Select::new();
            for (_, socket) in &self.sockets {
                sel.recv(&socket.rx);
            }
            match sel.select_timeout(timeout) {
                Ok(oper) => {
                    let index = oper.index();
                    let (topic, socket) = &self.sockets[index];
                    oper.recv(&socket.rx).ok().map(|msg| (*topic, msg))
                },
                Err(_) => None,
            }
        };

        if let Some((topic, msg)) = first {
            self.latest.insert(topic, msg);
            self.updated.insert(topic, true);
            // 第一条到手后把同批到达的也一起收了
            self.drain();
        }
    }

    fn drain(&mut self) -> bool {
        let mut got_any = false;
        for (topic, socket) in &self.sockets {
            while let Some(msg) = socket.try_receive() {
                self.latest.insert(*topic, msg);
                self.updated.insert(*topic, true);
                got_any = true;
            }
        }
        got_any
    }

    /// 通道在最近一次 `update()` 中是否收到了消息
    pub fn updated(&self, topic: &str) -> bool {
        self.updated.get(topic).copied().unwrap_or(false)
    }

    /// 通道的最新消息（跨轮保留）
    pub fn get(&self, topic: &str) -> Option<&Message> {
        self.latest.get(topic)
    }
}
