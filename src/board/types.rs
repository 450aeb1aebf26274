//! 板卡侧公共类型定义
//!
//! 硬件型号、安全模型、故障枚举与健康快照。数值与固件侧约定一致，
//! 不要随意改动判别值。

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// 板卡硬件型号
///
/// 连接阶段据此分配槽位：`BLACK` / `DOS` 进入 `main`，其余进入 `aux`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HwType {
    #[default]
    Unknown = 0,
    White = 1,
    Grey = 2,
    Black = 3,
    Pedal = 4,
    Uno = 5,
    Dos = 6,
}

impl HwType {
    /// 从固件返回的原始字节解析
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::White,
            2 => Self::Grey,
            3 => Self::Black,
            4 => Self::Pedal,
            5 => Self::Uno,
            6 => Self::Dos,
            _ => Self::Unknown,
        }
    }

    /// 是否承担整车主总线角色（决定 main 槽位归属）
    pub fn is_main_candidate(self) -> bool {
        matches!(self, Self::Black | Self::Dos)
    }

    /// 是否带风扇/红外外设（UNO / DOS 专有）
    pub fn has_fan_and_ir(self) -> bool {
        matches!(self, Self::Uno | Self::Dos)
    }

    /// 是否带电池供电 RTC
    pub fn has_rtc(self) -> bool {
        matches!(self, Self::Uno | Self::Dos)
    }
}

/// 安全模型
///
/// 控制固件转发/拦截哪些 CAN 报文。`NoOutput` 最保守，`Elm327` 为诊断模式，
/// 其余为车型专用模型。判别值即固件侧模型编号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum SafetyModel {
    Silent = 0,
    HondaNidec = 1,
    Toyota = 2,
    Elm327 = 3,
    Gm = 4,
    HondaBoschGiraffe = 5,
    Ford = 6,
    Hyundai = 8,
    Chrysler = 9,
    Tesla = 10,
    SubaruLegacy = 11,
    Mazda = 12,
    Nissan = 13,
    Volkswagen = 14,
    AllOutput = 16,
    GmAscm = 17,
    #[default]
    NoOutput = 19,
    HondaBoschHarness = 20,
    Subaru = 21,
}

impl SafetyModel {
    /// 从原始模型编号解析
    ///
    /// 未知编号按 `Silent` 处理：状态环路会立刻把 `Silent` 纠正为
    /// `NoOutput`，所以未知值最终落在最保守的模型上。
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Silent,
            1 => Self::HondaNidec,
            2 => Self::Toyota,
            3 => Self::Elm327,
            4 => Self::Gm,
            5 => Self::HondaBoschGiraffe,
            6 => Self::Ford,
            8 => Self::Hyundai,
            9 => Self::Chrysler,
            10 => Self::Tesla,
            11 => Self::SubaruLegacy,
            12 => Self::Mazda,
            13 => Self::Nissan,
            14 => Self::Volkswagen,
            16 => Self::AllOutput,
            17 => Self::GmAscm,
            19 => Self::NoOutput,
            20 => Self::HondaBoschHarness,
            21 => Self::Subaru,
            _ => Self::Silent,
        }
    }
}

/// USB 供电模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UsbPowerMode {
    #[default]
    None = 0,
    /// 不对主机充电
    Client = 1,
    /// 充电下行口（对主机充电）
    Cdp = 2,
    /// 专用充电口
    Dcp = 3,
}

impl UsbPowerMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Client,
            2 => Self::Cdp,
            3 => Self::Dcp,
            _ => Self::None,
        }
    }
}

/// 固件故障总体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FaultStatus {
    #[default]
    None = 0,
    FaultTemp = 1,
    FaultPerm = 2,
}

impl FaultStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::FaultTemp,
            2 => Self::FaultPerm,
            _ => Self::None,
        }
    }
}

/// 车辆线束识别状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HarnessStatus {
    #[default]
    NotConnected = 0,
    Normal = 1,
    Flipped = 2,
}

impl HarnessStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Normal,
            2 => Self::Flipped,
            _ => Self::NotConnected,
        }
    }
}

/// 故障种类（`faults` 位集中的位序号）
///
/// 注意：发布故障列表时按判别值升序遍历 `RelayMalfunction` 到
/// `InterruptRateTick`，顺序是对外契约的一部分。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    RelayMalfunction = 0,
    UnusedInterruptHandled = 1,
    InterruptRateCan1 = 2,
    InterruptRateCan2 = 3,
    InterruptRateCan3 = 4,
    InterruptRateTach = 5,
    InterruptRateGmlan = 6,
    InterruptRateInterrupts = 7,
    InterruptRateSpiDma = 8,
    InterruptRateSpiCs = 9,
    InterruptRateUart1 = 10,
    InterruptRateUart2 = 11,
    InterruptRateUart3 = 12,
    InterruptRateUart5 = 13,
    InterruptRateUartDma = 14,
    InterruptRateUsb = 15,
    InterruptRateTim1 = 16,
    InterruptRateTim3 = 17,
    RegisterDivergent = 18,
    InterruptRateKlineInit = 19,
    InterruptRateClockSource = 20,
    InterruptRateTick = 21,
}

impl FaultKind {
    /// 位序号范围的下界（含）
    pub const FIRST: u8 = Self::RelayMalfunction as u8;
    /// 位序号范围的上界（含）
    pub const LAST: u8 = Self::InterruptRateTick as u8;

    /// 从位序号解析
    pub fn from_bit(bit: u8) -> Option<Self> {
        match bit {
            0 => Some(Self::RelayMalfunction),
            1 => Some(Self::UnusedInterruptHandled),
            2 => Some(Self::InterruptRateCan1),
            3 => Some(Self::InterruptRateCan2),
            4 => Some(Self::InterruptRateCan3),
            5 => Some(Self::InterruptRateTach),
            6 => Some(Self::InterruptRateGmlan),
            7 => Some(Self::InterruptRateInterrupts),
            8 => Some(Self::InterruptRateSpiDma),
            9 => Some(Self::InterruptRateSpiCs),
            10 => Some(Self::InterruptRateUart1),
            11 => Some(Self::InterruptRateUart2),
            12 => Some(Self::InterruptRateUart3),
            13 => Some(Self::InterruptRateUart5),
            14 => Some(Self::InterruptRateUartDma),
            15 => Some(Self::InterruptRateUsb),
            16 => Some(Self::InterruptRateTim1),
            17 => Some(Self::InterruptRateTim3),
            18 => Some(Self::RegisterDivergent),
            19 => Some(Self::InterruptRateKlineInit),
            20 => Some(Self::InterruptRateClockSource),
            21 => Some(Self::InterruptRateTick),
            _ => None,
        }
    }
}

/// 单块板卡的健康快照（2Hz 轮询产物）
///
/// 字段与固件健康包一一对应，解析逻辑见 `board::protocol`。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    /// 固件运行时长（秒）
    pub uptime: u32,
    /// 供电电压（mV）
    pub voltage: u32,
    /// 供电电流（mA）
    pub current: u32,
    pub can_rx_errs: u32,
    pub can_send_errs: u32,
    pub can_fwd_errs: u32,
    pub gmlan_send_errs: u32,
    /// 故障位集，位序号见 [`FaultKind`]
    pub faults: u32,
    /// 点火线电平（非 0 即有效）
    pub ignition_line: u8,
    /// CAN 侧点火判定（非 0 即有效）
    pub ignition_can: u8,
    pub controls_allowed: bool,
    pub gas_interceptor_detected: bool,
    pub harness_status: HarnessStatus,
    pub usb_power_mode: UsbPowerMode,
    pub safety_model: SafetyModel,
    pub safety_param: i16,
    pub fault_status: FaultStatus,
    pub power_save_enabled: bool,
    pub heartbeat_lost: bool,
}

impl HealthSnapshot {
    /// 按位序号升序枚举当前激活的故障
    pub fn active_faults(&self) -> Vec<FaultKind> {
        (FaultKind::FIRST..=FaultKind::LAST)
            .filter(|bit| self.faults & (1u32 << bit) != 0)
            .filter_map(FaultKind::from_bit)
            .collect()
    }
}

/// 板载 RTC 时间（UTC 民用时间字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl RtcTime {
    /// 转换为 UTC 时间点；字段非法时返回 `None`
    pub fn to_datetime(&self) -> Option<OffsetDateTime> {
        let month = Month::try_from(self.month).ok()?;
        let date = Date::from_calendar_date(i32::from(self.year), month, self.day).ok()?;
        let tod = Time::from_hms(self.hour, self.minute, self.second).ok()?;
        Some(PrimitiveDateTime::new(date, tod).assume_utc())
    }

    /// 从 UTC 时间点构造
    pub fn from_datetime(dt: &OffsetDateTime) -> Self {
        Self {
            year: dt.year() as u16,
            month: dt.month() as u8,
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    /// RTC 读数是否可信（字段合法且不早于 2021 年）
    pub fn valid(&self) -> bool {
        match self.to_datetime() {
            Some(dt) => crate::timeutil::wall_time_valid(&dt),
            None => false,
        }
    }
}

/// 车型参数中与本进程相关的子集
///
/// 参数仓库里 `CarParams` 的字节编码：小端 `u16` 安全模型编号 + 小端
/// `i16` 安全参数。车型识别进程按同样的布局写入。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarParams {
    pub safety_model: SafetyModel,
    pub safety_param: i16,
}

impl CarParams {
    /// 编码为参数仓库字节
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&(self.safety_model as u16).to_le_bytes());
        out.extend_from_slice(&self.safety_param.to_le_bytes());
        out
    }

    /// 从参数仓库字节解码；长度不足返回 `None`
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < 4 {
            return None;
        }
        let model = u16::from_le_bytes([raw[0], raw[1]]);
        let param = i16::from_le_bytes([raw[2], raw[3]]);
        Some(Self {
            safety_model: SafetyModel::from_raw(model),
            safety_param: param,
        })
    }
}
