//! 板卡接入层核心定义
//!
//! 提供统一的板卡接口抽象。生产环境走 USB 后端（`UsbBoardProvider`），
//! 测试走 mock 后端，监督运行时只依赖这里的 trait。

use bytes::BytesMut;
use thiserror::Error;

pub mod protocol;
pub mod types;
pub mod usb;

pub use types::{
    CarParams, FaultKind, FaultStatus, HarnessStatus, HealthSnapshot, HwType, RtcTime,
    SafetyModel, UsbPowerMode,
};
pub use usb::{UsbBoard, UsbBoardProvider};

use crate::messaging::codec::CanFrame;

/// 板卡接入层统一错误类型
#[derive(Error, Debug)]
pub enum BoardError {
    /// USB 底层错误
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// IO 底层错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 设备相关错误（设备未找到、已断开、响应非法等）
    #[error("Device error: {0}")]
    Device(#[from] BoardDeviceError),

    /// 操作超时（非致命，可以重试）
    #[error("Operation timeout")]
    Timeout,

    /// 会话已判定断开，拒绝继续操作
    #[error("Board not connected")]
    NotConnected,

    /// 设备返回的数据长度不符
    #[error("Invalid response: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },
}

/// 设备错误的结构化分类（不绑定具体后端实现）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardDeviceErrorKind {
    Unknown,
    /// 设备未找到/不存在（热拔插或枚举不到）
    NotFound,
    /// 设备已断开
    NoDevice,
    /// 权限不足/被拒绝
    AccessDenied,
    /// 资源忙/被占用
    Busy,
    /// 固件返回了无法解析的数据
    Malformed,
}

/// 结构化设备错误：kind + message（保留人类可读信息，供日志/上层策略判断）
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct BoardDeviceError {
    pub kind: BoardDeviceErrorKind,
    pub message: String,
}

impl BoardDeviceError {
    pub fn new(kind: BoardDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 判断是否为致命错误
    ///
    /// 致命错误表示设备会话已不可用，外层应销毁板卡并重新进入发现流程；
    /// 非致命错误可以重试或忽略。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            BoardDeviceErrorKind::NoDevice
                | BoardDeviceErrorKind::NotFound
                | BoardDeviceErrorKind::AccessDenied
        )
    }
}

/// 板卡会话接口
///
/// 对应一条已建立的 USB 会话。所有方法取 `&self`：底层传输允许并发，
/// 但仅限不同端点上的不同操作同时进行（监督运行时的线程划分保证了这点）。
///
/// # 语义
/// - 命令类方法（`set_*`、`send_heartbeat`）为 Fire-and-Forget，写入成功即返回
/// - 查询类方法阻塞直到设备应答或超时
/// - 任何致命 USB 错误都会让 `connected()` 翻转为 `false`，各环路据此退出
pub trait Board: Send + Sync {
    /// 硬件型号（连接时确定，之后不变）
    fn hw_type(&self) -> HwType;

    /// USB 序列号
    fn usb_serial(&self) -> &str;

    /// 会话是否仍然有效
    fn connected(&self) -> bool;

    /// 最近一轮通信是否健康（用于对外报文的 valid 位）
    fn comms_healthy(&self) -> bool;

    /// 是否带电池供电 RTC
    fn has_rtc(&self) -> bool;

    /// 读取固件签名（8 字节）
    fn get_firmware_version(&self) -> Result<[u8; 8], BoardError>;

    /// 读取固件侧序列号
    fn get_serial(&self) -> Result<String, BoardError>;

    /// 设置 USB 供电模式
    fn set_usb_power_mode(&self, mode: UsbPowerMode) -> Result<(), BoardError>;

    /// 设置安全模型
    fn set_safety_model(&self, model: SafetyModel, param: i16) -> Result<(), BoardError>;

    /// 设置非安全模式位（0 = 全部关闭）
    fn set_unsafe_mode(&self, mode: u16) -> Result<(), BoardError>;

    /// 开关省电模式
    fn set_power_saving(&self, enable: bool) -> Result<(), BoardError>;

    /// 开关 CAN 回环
    fn set_loopback(&self, enable: bool) -> Result<(), BoardError>;

    /// 读取板载 RTC
    fn get_rtc(&self) -> Result<RtcTime, BoardError>;

    /// 写入板载 RTC
    fn set_rtc(&self, time: RtcTime) -> Result<(), BoardError>;

    /// 轮询健康快照
    fn get_state(&self) -> Result<HealthSnapshot, BoardError>;

    /// 排空接收缓冲区
    ///
    /// 把当前可取的 CAN 帧按 `messaging::codec` 的批量格式追加到 `out`，
    /// 总线号整体加上 `bus_shift`，返回追加的帧数。没有数据时返回 0。
    fn can_receive(&self, out: &mut BytesMut, bus_shift: u8) -> Result<usize, BoardError>;

    /// 下发一批 CAN 帧
    fn can_send(&self, frames: &[CanFrame]) -> Result<(), BoardError>;

    /// 设置风扇转速（百分比）
    fn set_fan_speed(&self, percent: u16) -> Result<(), BoardError>;

    /// 读取风扇实际转速（RPM）
    fn get_fan_speed(&self) -> Result<u16, BoardError>;

    /// 设置红外补光功率（百分比）
    fn set_ir_pwr(&self, percent: u16) -> Result<(), BoardError>;

    /// 喂固件看门狗
    ///
    /// 停止喂狗后固件自行回落到 `NoOutput`，这是整个失效策略的兜底。
    fn send_heartbeat(&self) -> Result<(), BoardError>;

    /// 从板载 UART 透传口读字节（GPS 接收机挂在上面）
    fn serial_read(&self, port: u8) -> Result<Vec<u8>, BoardError>;

    /// 向板载 UART 透传口写字节
    fn serial_write(&self, port: u8, data: &[u8]) -> Result<(), BoardError>;

    /// 开关 GPS 模块供电轨
    fn set_gps_power(&self, on: bool) -> Result<(), BoardError>;
}

/// 板卡发现/打开接口
///
/// 把「枚举有哪些板卡」和「按序列号建立会话」从监督运行时里拆出来，
/// 测试时注入 mock 实现。
pub trait BoardProvider: Send + Sync {
    type Board: Board + 'static;

    /// 枚举当前在线板卡的 USB 序列号
    fn list(&self) -> Result<Vec<String>, BoardError>;

    /// 按序列号建立会话
    ///
    /// # 错误处理
    /// - 设备消失 → `BoardDeviceErrorKind::NotFound`，外层下个发现周期重试
    /// - 权限不足 → `BoardDeviceErrorKind::AccessDenied`
    fn open(&self, serial: &str) -> Result<Self::Board, BoardError>;
}
