//! 监督运行时
//!
//! 持有两个板卡槽位和全部共享标志，按固定的线程划分驱动各个环路：
//!
//! - `state_loop`：2Hz 健康轮询、点火推导、安全/省电状态迁移
//! - `can_rx` / `can_tx`：100Hz 收包与事件驱动发包
//! - `hardware_loop`：风扇/红外/充电控制
//! - `gps_loop`：100Hz GPS 字节泵
//! - `safety_setter`：每个点火周期一次的短生命周期任务
//!
//! ## 生命周期
//!
//! 槽位只在「没有任何工作线程在跑」的窗口里写入（连接阶段与拆除阶段），
//! 工作线程只读。任何线程观察到 `main` 断开就退出，外层 join 全部线程、
//! 销毁板卡后重新进入发现流程，直到收到退出请求。共享标志都是单写者
//! 多读者的原子布尔，不需要额外的锁。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::board::{Board, BoardProvider};
use crate::hardware::{self, Platform};
use crate::messaging::MessageHub;
use crate::params::ParamStore;
use crate::pigeon::{BoardPigeon, Pigeon, TtyPigeon};

mod can_rx;
mod can_tx;
mod connect;
mod gps_loop;
mod hardware_loop;
mod safety_setter;
mod state_loop;

/// 实时调度优先级
const RT_PRIORITY: i32 = 54;

/// TICI 上 GPS 直连串口设备
const TICI_GPS_TTY: &str = "/dev/ttyHS0";

/// 运行时配置（环境开关 + 平台）
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `BOARDD_LOOPBACK`：连接后打开板卡回环
    pub loopback: bool,
    /// `STARTED`：仿真场景强制点火线有效
    pub spoof_started: bool,
    /// `FAKESEND`：消费 `sendcan` 但不真正下发
    pub fake_send: bool,
    /// `AUX_CAN_DRIVE`：主辅总线号互换，发包改走 aux
    pub aux_can_drive: bool,
    pub platform: Platform,
}

impl RuntimeConfig {
    /// 从环境变量读取开关
    pub fn from_env(platform: Platform) -> Self {
        Self {
            loopback: std::env::var_os("BOARDD_LOOPBACK").is_some(),
            spoof_started: std::env::var_os("STARTED").is_some(),
            fake_send: std::env::var_os("FAKESEND").is_some(),
            aux_can_drive: std::env::var_os("AUX_CAN_DRIVE").is_some(),
            platform,
        }
    }

    /// main 槽位的总线号偏移
    pub fn main_shift(&self) -> u8 {
        if self.aux_can_drive { 3 } else { 0 }
    }

    /// aux 槽位的总线号偏移
    pub fn aux_shift(&self) -> u8 {
        if self.aux_can_drive { 0 } else { 3 }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            loopback: false,
            spoof_started: false,
            fake_send: false,
            aux_can_drive: false,
            platform: Platform::Generic,
        }
    }
}

/// 监督器：板卡槽位 + 共享状态 + 环路编排
pub struct Supervisor<P: BoardProvider> {
    pub(crate) provider: P,
    pub(crate) hub: Arc<MessageHub>,
    pub(crate) params: Arc<dyn ParamStore>,
    pub(crate) config: RuntimeConfig,

    /// main 槽位（工作期间只读）
    pub(crate) main: ArcSwapOption<P::Board>,
    /// aux 槽位（工作期间只读）
    pub(crate) aux: ArcSwapOption<P::Board>,

    exit_requested: AtomicBool,
    ignition: AtomicBool,
    pub(crate) safety_setter_running: AtomicBool,
    /// 本进程生命周期内是否成功打开过板卡（首次才下发 CDP）
    pub(crate) connected_once: AtomicBool,

    /// 发现到但尚未打开的序列号
    pub(crate) detected: Mutex<Vec<String>>,
    /// 已打开的序列号
    pub(crate) connected: Mutex<Vec<String>>,
}

impl<P> Supervisor<P>
where
    P: BoardProvider + 'static,
{
    pub fn new(
        provider: P,
        hub: Arc<MessageHub>,
        params: Arc<dyn ParamStore>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            hub,
            params,
            config,
            main: ArcSwapOption::const_empty(),
            aux: ArcSwapOption::const_empty(),
            exit_requested: AtomicBool::new(false),
            ignition: AtomicBool::new(false),
            safety_setter_running: AtomicBool::new(false),
            connected_once: AtomicBool::new(false),
            detected: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
        })
    }

    // ─── 共享状态访问 ───

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// 请求退出（信号处理器调用）
    ///
    /// 同时中断消息枢纽，让阻塞在订阅上的环路立刻醒来。
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
        self.hub.interrupt();
    }

    pub fn ignition(&self) -> bool {
        self.ignition.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ignition(&self, on: bool) {
        self.ignition.store(on, Ordering::SeqCst);
    }

    /// main 槽位快照
    pub fn main_board(&self) -> Option<Arc<P::Board>> {
        self.main.load_full()
    }

    /// aux 槽位快照
    pub fn aux_board(&self) -> Option<Arc<P::Board>> {
        self.aux.load_full()
    }

    /// 工作线程的存活条件：未请求退出且 main 在线
    pub(crate) fn workers_alive(&self) -> bool {
        if self.exit_requested() {
            return false;
        }
        match self.main_board() {
            Some(board) => board.connected(),
            None => false,
        }
    }

    pub fn message_hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    // ─── 主循环 ───

    /// 进入监督主循环，直到收到退出请求才返回
    ///
    /// 每一轮：先起状态环路（负责未连接期间的保活报文），连接成功后
    /// 再起其余工作线程；任何一个环路退出意味着链路坏了，join 全部
    /// 线程、销毁板卡、重新发现。
    pub fn run(self: &Arc<Self>) {
        if let Err(e) = hardware::set_realtime_priority(RT_PRIORITY) {
            warn!("failed to set realtime priority: {e}");
        }
        let core = self.config.platform.daemon_core();
        if let Err(e) = hardware::set_core_affinity(core) {
            warn!("failed to pin to core {core}: {e}");
        }

        while !self.exit_requested() {
            let mut handles = Vec::new();

            let sup = Arc::clone(self);
            handles.push(thread::spawn(move || state_loop::board_state_loop(&sup)));

            if self.connect_boards() {
                let sup = Arc::clone(self);
                handles.push(thread::spawn(move || can_tx::can_send_loop(&sup)));

                let sup = Arc::clone(self);
                handles.push(thread::spawn(move || can_rx::can_recv_loop(&sup)));

                let sup = Arc::clone(self);
                handles.push(thread::spawn(move || {
                    hardware_loop::hardware_control_loop(&sup)
                }));

                let sup = Arc::clone(self);
                handles.push(thread::spawn(move || match sup.build_pigeon() {
                    Some(mut pigeon) => gps_loop::gps_loop(&sup, pigeon.as_mut()),
                    None => warn!("GPS receiver unavailable, skipping GPS loop"),
                }));
            }

            for handle in handles {
                if handle.join().is_err() {
                    warn!("worker thread panicked");
                }
            }

            // 拆除：此刻没有任何工作线程，槽位可以安全清空
            self.main.store(None);
            self.aux.store(None);
            self.connected.lock().clear();
            info!("boards released, restarting discovery");
        }
    }

    /// 按平台构建 GPS 接收机
    fn build_pigeon(&self) -> Option<Box<dyn Pigeon>> {
        if self.config.platform.is_tici() {
            match TtyPigeon::open(TICI_GPS_TTY) {
                Ok(pigeon) => Some(Box::new(pigeon)),
                Err(e) => {
                    warn!("failed to open {TICI_GPS_TTY}: {e}");
                    None
                },
            }
        } else {
            self.main_board()
                .map(|board| Box::new(BoardPigeon::new(board)) as Box<dyn Pigeon>)
        }
    }
}
