//! 板卡 USB 控制协议常量与报文解析
//!
//! 固件侧的控制请求号、端点号和健康包布局集中定义在这里，
//! `usb.rs` 只做传输，不关心字节含义。

use bytes::Buf;

use crate::board::types::{
    FaultStatus, HarnessStatus, HealthSnapshot, RtcTime, SafetyModel, UsbPowerMode,
};
use crate::board::{BoardDeviceError, BoardDeviceErrorKind, BoardError};

// ─── USB 请求方向 ───

/// 设备到主机（vendor 请求）
pub const REQ_IN: u8 = 0xC0;
/// 主机到设备（vendor 请求）
pub const REQ_OUT: u8 = 0x40;

// ─── 控制请求号 ───

/// 读 RTC（应答为 [`RTC_PACKET_SIZE`] 字节）
pub const BREQ_RTC_GET: u8 = 0xA0;
/// 写 RTC 年（其余字段依次 0xA2..0xA7）
pub const BREQ_RTC_SET_YEAR: u8 = 0xA1;
pub const BREQ_RTC_SET_MONTH: u8 = 0xA2;
pub const BREQ_RTC_SET_DAY: u8 = 0xA3;
pub const BREQ_RTC_SET_HOUR: u8 = 0xA4;
pub const BREQ_RTC_SET_MINUTE: u8 = 0xA5;
pub const BREQ_RTC_SET_SECOND: u8 = 0xA6;

/// 设置红外补光功率
pub const BREQ_IR_PWR: u8 = 0xB0;
/// 设置风扇转速（百分比）
pub const BREQ_FAN_SET: u8 = 0xB1;
/// 读风扇转速（RPM，2 字节应答）
pub const BREQ_FAN_GET: u8 = 0xB2;

/// 读硬件型号（1 字节应答）
pub const BREQ_HW_TYPE: u8 = 0xC1;

/// 读序列号（ASCII）
pub const BREQ_SERIAL: u8 = 0xD0;
/// 开关 GPS 模块供电轨
pub const BREQ_GPS_POWER: u8 = 0xD9;
/// 读健康包
pub const BREQ_HEALTH: u8 = 0xD2;
/// 读固件签名（8 字节应答）
pub const BREQ_FW_SIGNATURE: u8 = 0xD3;

/// 设置安全模型（wValue=模型，wIndex=参数）
pub const BREQ_SAFETY_MODEL: u8 = 0xDC;
/// 设置非安全模式位
pub const BREQ_UNSAFE_MODE: u8 = 0xDF;

/// UART 透传读（wIndex=端口号）
pub const BREQ_UART_READ: u8 = 0xE0;
/// UART 透传写（wValue=端口号）
pub const BREQ_UART_WRITE: u8 = 0xE1;
/// 开关 CAN 回环
pub const BREQ_LOOPBACK: u8 = 0xE5;
/// 设置 USB 供电模式
pub const BREQ_USB_POWER_MODE: u8 = 0xE6;
/// 开关省电模式
pub const BREQ_POWER_SAVING: u8 = 0xE7;

/// 喂看门狗
pub const BREQ_HEARTBEAT: u8 = 0xF3;

// ─── 端点 ───

/// CAN 批量接收端点（Bulk IN）
pub const EP_CAN_IN: u8 = 0x81;
/// CAN 批量发送端点（Bulk OUT）
pub const EP_CAN_OUT: u8 = 0x03;

/// 健康包长度
pub const HEALTH_PACKET_SIZE: usize = 44;
/// RTC 应答长度：year(u16) month day hour minute second
pub const RTC_PACKET_SIZE: usize = 8;
/// 序列号应答长度
pub const SERIAL_PACKET_SIZE: usize = 16;

/// 解析健康包
///
/// 布局（全部小端）：
/// 8 个 u32（uptime, voltage, current, can_rx_errs, can_send_errs,
/// can_fwd_errs, gmlan_send_errs, faults），10 个 u8（ignition_line,
/// ignition_can, controls_allowed, gas_interceptor_detected,
/// harness_status, usb_power_mode, safety_model, fault_status,
/// power_save_enabled, heartbeat_lost），最后 i16 safety_param。
pub fn parse_health(raw: &[u8]) -> Result<HealthSnapshot, BoardError> {
    if raw.len() < HEALTH_PACKET_SIZE {
        return Err(BoardError::InvalidResponse {
            expected: HEALTH_PACKET_SIZE,
            actual: raw.len(),
        });
    }

    let mut buf = raw;
    Ok(HealthSnapshot {
        uptime: buf.get_u32_le(),
        voltage: buf.get_u32_le(),
        current: buf.get_u32_le(),
        can_rx_errs: buf.get_u32_le(),
        can_send_errs: buf.get_u32_le(),
        can_fwd_errs: buf.get_u32_le(),
        gmlan_send_errs: buf.get_u32_le(),
        faults: buf.get_u32_le(),
        ignition_line: buf.get_u8(),
        ignition_can: buf.get_u8(),
        controls_allowed: buf.get_u8() != 0,
        gas_interceptor_detected: buf.get_u8() != 0,
        harness_status: HarnessStatus::from_raw(buf.get_u8()),
        usb_power_mode: UsbPowerMode::from_raw(buf.get_u8()),
        safety_model: SafetyModel::from_raw(u16::from(buf.get_u8())),
        fault_status: FaultStatus::from_raw(buf.get_u8()),
        power_save_enabled: buf.get_u8() != 0,
        heartbeat_lost: buf.get_u8() != 0,
        safety_param: buf.get_i16_le(),
    })
}

/// 解析 RTC 应答
pub fn parse_rtc(raw: &[u8]) -> Result<RtcTime, BoardError> {
    if raw.len() < RTC_PACKET_SIZE {
        return Err(BoardError::InvalidResponse {
            expected: RTC_PACKET_SIZE,
            actual: raw.len(),
        });
    }
    let mut buf = raw;
    let time = RtcTime {
        year: buf.get_u16_le(),
        month: buf.get_u8(),
        day: buf.get_u8(),
        hour: buf.get_u8(),
        minute: buf.get_u8(),
        second: buf.get_u8(),
    };
    // 末尾 1 字节保留
    Ok(time)
}

/// 解析序列号应答（ASCII，NUL 填充）
pub fn parse_serial(raw: &[u8]) -> Result<String, BoardError> {
    let trimmed: Vec<u8> = raw.iter().copied().take_while(|b| *b != 0).collect();
    String::from_utf8(trimmed).map_err(|_| {
        BoardError::Device(BoardDeviceError::new(
            BoardDeviceErrorKind::Malformed,
            "serial is not valid ASCII",
        ))
    })
}

/// 固件签名转小写十六进制（16 个字符）
pub fn fw_signature_hex(sig: &[u8; 8]) -> String {
    let mut out = String::with_capacity(16);
    for byte in sig {
        out.push(nibble_to_hex(byte >> 4));
        out.push(nibble_to_hex(byte & 0x0F));
    }
    out
}

fn nibble_to_hex(n: u8) -> char {
    if n < 10 {
        (b'0' + n) as char
    } else {
        (b'a' + n - 10) as char
    }
}
