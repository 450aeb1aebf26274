//! USB 板卡后端
//!
//! 基于 rusb 的设备扫描、会话建立与传输。控制请求做配置/查询，
//! CAN 数据走 Bulk 端点。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use rusb::{DeviceHandle, GlobalContext};
use tracing::{trace, warn};

use crate::board::protocol::*;
use crate::board::types::{HealthSnapshot, HwType, RtcTime, SafetyModel, UsbPowerMode};
use crate::board::{Board, BoardDeviceError, BoardDeviceErrorKind, BoardError, BoardProvider};
use crate::messaging::codec::{self, CanFrame};

/// 板卡的 USB VID/PID
const BOARD_VID: u16 = 0xBBAA;
const BOARD_PID: u16 = 0xDDCC;

/// 控制传输超时
const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
/// CAN Bulk IN 超时（排空语义：超时等于没有数据）
const CAN_READ_TIMEOUT: Duration = Duration::from_millis(5);
/// CAN Bulk OUT 超时
const CAN_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// USB 板卡发现后端
#[derive(Debug, Default)]
pub struct UsbBoardProvider;

impl UsbBoardProvider {
    pub fn new() -> Self {
        Self
    }

    /// 判断是否为板卡设备
    fn is_board(vendor_id: u16, product_id: u16) -> bool {
        (vendor_id, product_id) == (BOARD_VID, BOARD_PID)
    }
}

impl BoardProvider for UsbBoardProvider {
    type Board = UsbBoard;

    /// 扫描所有在线板卡，返回 USB 序列号列表
    ///
    /// 读不出序列号的设备直接跳过（后续按序列号打开时也无法定位它）。
    fn list(&self) -> Result<Vec<String>, BoardError> {
        let mut serials = Vec::new();

        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if !Self::is_board(desc.vendor_id(), desc.product_id()) {
                continue;
            }
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(_) => continue,
            };
            match desc.serial_number_string_index() {
                Some(idx) if idx != 0 => {
                    if let Ok(serial) = handle.read_string_descriptor_ascii(idx) {
                        serials.push(serial);
                    }
                },
                _ => continue,
            }
        }

        Ok(serials)
    }

    fn open(&self, serial: &str) -> Result<UsbBoard, BoardError> {
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if !Self::is_board(desc.vendor_id(), desc.product_id()) {
                continue;
            }
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(rusb::Error::Access) => {
                    return Err(BoardError::Device(BoardDeviceError::new(
                        BoardDeviceErrorKind::AccessDenied,
                        format!("open {serial}: access denied"),
                    )));
                },
                Err(_) => continue,
            };

            let dev_serial = match desc.serial_number_string_index() {
                Some(idx) if idx != 0 => match handle.read_string_descriptor_ascii(idx) {
                    Ok(s) => s,
                    Err(_) => continue,
                },
                _ => continue,
            };
            if dev_serial != serial {
                continue;
            }

            // Detach kernel driver（claim 之前）
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            {
                if handle.kernel_driver_active(0).unwrap_or(false) {
                    handle.detach_kernel_driver(0)?;
                }
            }
            handle.claim_interface(0)?;

            return UsbBoard::with_session(handle, dev_serial);
        }

        Err(BoardError::Device(BoardDeviceError::new(
            BoardDeviceErrorKind::NotFound,
            format!("board {serial} not found"),
        )))
    }
}

/// 一条已建立的 USB 板卡会话
///
/// 传输方法都取 `&self`（libusb 的传输接口本身线程安全），不同端点上的
/// 操作可以并发。致命 USB 错误把 `connected` 翻转为 `false`，此后所有
/// 操作直接拒绝。
pub struct UsbBoard {
    handle: DeviceHandle<GlobalContext>,
    serial: String,
    hw_type: HwType,
    connected: AtomicBool,
    comms_healthy: AtomicBool,
}

impl UsbBoard {
    /// 在已 claim 的句柄上完成会话初始化（读硬件型号）
    fn with_session(handle: DeviceHandle<GlobalContext>, serial: String) -> Result<Self, BoardError> {
        let mut board = Self {
            handle,
            serial,
            hw_type: HwType::Unknown,
            connected: AtomicBool::new(true),
            comms_healthy: AtomicBool::new(true),
        };
        let raw = board.control_in(BREQ_HW_TYPE, 0, 0, 1)?;
        let hw_type = HwType::from_raw(raw[0]);
        trace!("board {} hw_type={:?}", board.serial, hw_type);
        board.hw_type = hw_type;
        Ok(board)
    }

    /// 记录一次成功传输
    fn note_usb_ok(&self) {
        self.comms_healthy.store(true, Ordering::SeqCst);
    }

    /// 记录一次传输失败
    ///
    /// 设备拔出等致命错误之后继续收发毫无意义，标记断开让各环路退出。
    fn note_usb_error(&self, e: &rusb::Error) {
        self.comms_healthy.store(false, Ordering::SeqCst);
        if matches!(e, rusb::Error::NoDevice | rusb::Error::Io | rusb::Error::Pipe) {
            self.connected.store(false, Ordering::SeqCst);
            warn!("board {}: fatal USB error: {}", self.serial, e);
        }
    }

    fn ensure_connected(&self) -> Result<(), BoardError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BoardError::NotConnected)
        }
    }

    /// 执行控制 OUT 传输
    fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<(), BoardError> {
        self.ensure_connected()?;
        match self
            .handle
            .write_control(REQ_OUT, request, value, index, data, CONTROL_TIMEOUT)
        {
            Ok(_) => {
                self.note_usb_ok();
                Ok(())
            },
            Err(e) => {
                self.note_usb_error(&e);
                Err(e.into())
            },
        }
    }

    /// 执行控制 IN 传输，校验应答长度
    fn control_in(&self, request: u8, value: u16, index: u16, length: usize) -> Result<Vec<u8>, BoardError> {
        self.ensure_connected()?;
        let mut buf = vec![0u8; length];
        let len = match self
            .handle
            .read_control(REQ_IN, request, value, index, &mut buf, CONTROL_TIMEOUT)
        {
            Ok(len) => {
                self.note_usb_ok();
                len
            },
            Err(e) => {
                self.note_usb_error(&e);
                return Err(e.into());
            },
        };
        if len < length {
            return Err(BoardError::InvalidResponse {
                expected: length,
                actual: len,
            });
        }
        Ok(buf)
    }
}

impl Board for UsbBoard {
    fn hw_type(&self) -> HwType {
        self.hw_type
    }

    fn usb_serial(&self) -> &str {
        &self.serial
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn comms_healthy(&self) -> bool {
        self.comms_healthy.load(Ordering::SeqCst)
    }

    fn has_rtc(&self) -> bool {
        self.hw_type.has_rtc()
    }

    fn get_firmware_version(&self) -> Result<[u8; 8], BoardError> {
        let raw = self.control_in(BREQ_FW_SIGNATURE, 0, 0, 8)?;
        let mut sig = [0u8; 8];
        sig.copy_from_slice(&raw[..8]);
        Ok(sig)
    }

    fn get_serial(&self) -> Result<String, BoardError> {
        let raw = self.control_in(BREQ_SERIAL, 0, 0, SERIAL_PACKET_SIZE)?;
        parse_serial(&raw)
    }

    fn set_usb_power_mode(&self, mode: UsbPowerMode) -> Result<(), BoardError> {
        self.control_out(BREQ_USB_POWER_MODE, mode as u16, 0, &[])
    }

    fn set_safety_model(&self, model: SafetyModel, param: i16) -> Result<(), BoardError> {
        self.control_out(BREQ_SAFETY_MODEL, model as u16, param as u16, &[])
    }

    fn set_unsafe_mode(&self, mode: u16) -> Result<(), BoardError> {
        self.control_out(BREQ_UNSAFE_MODE, mode, 0, &[])
    }

    fn set_power_saving(&self, enable: bool) -> Result<(), BoardError> {
        self.control_out(BREQ_POWER_SAVING, enable as u16, 0, &[])
    }

    fn set_loopback(&self, enable: bool) -> Result<(), BoardError> {
        self.control_out(BREQ_LOOPBACK, enable as u16, 0, &[])
    }

    fn get_rtc(&self) -> Result<RtcTime, BoardError> {
        let raw = self.control_in(BREQ_RTC_GET, 0, 0, RTC_PACKET_SIZE)?;
        parse_rtc(&raw)
    }

    fn set_rtc(&self, time: RtcTime) -> Result<(), BoardError> {
        // 固件按字段逐个写入
        self.control_out(BREQ_RTC_SET_YEAR, time.year, 0, &[])?;
        self.control_out(BREQ_RTC_SET_MONTH, u16::from(time.month), 0, &[])?;
        self.control_out(BREQ_RTC_SET_DAY, u16::from(time.day), 0, &[])?;
        self.control_out(BREQ_RTC_SET_HOUR, u16::from(time.hour), 0, &[])?;
        self.control_out(BREQ_RTC_SET_MINUTE, u16::from(time.minute), 0, &[])?;
        self.control_out(BREQ_RTC_SET_SECOND, u16::from(time.second), 0, &[])
    }

    fn get_state(&self) -> Result<HealthSnapshot, BoardError> {
        let raw = self.control_in(BREQ_HEALTH, 0, 0, HEALTH_PACKET_SIZE)?;
        parse_health(&raw)
    }

    fn can_receive(&self, out: &mut BytesMut, bus_shift: u8) -> Result<usize, BoardError> {
        self.ensure_connected()?;

        let mut buf = vec![0u8; 4096];
        let len = match self.handle.read_bulk(EP_CAN_IN, &mut buf, CAN_READ_TIMEOUT) {
            Ok(len) => {
                self.note_usb_ok();
                len
            },
            // 超时 = 本周期没有数据
            Err(rusb::Error::Timeout) => return Ok(0),
            Err(e) => {
                self.note_usb_error(&e);
                return Err(e.into());
            },
        };

        // 固件输出与通道批量格式一致，只需平移总线号后重编码
        let mut frames = codec::decode_can_batch(&buf[..len]).map_err(|e| {
            BoardError::Device(BoardDeviceError::new(
                BoardDeviceErrorKind::Malformed,
                format!("CAN bulk packet: {e}"),
            ))
        })?;
        for frame in &mut frames {
            frame.bus += bus_shift;
        }
        Ok(codec::encode_can_batch(&frames, out))
    }

    fn can_send(&self, frames: &[CanFrame]) -> Result<(), BoardError> {
        self.ensure_connected()?;
        let mut buf = BytesMut::new();
        codec::encode_can_batch(frames, &mut buf);
        match self.handle.write_bulk(EP_CAN_OUT, &buf, CAN_WRITE_TIMEOUT) {
            Ok(_) => {
                self.note_usb_ok();
                Ok(())
            },
            Err(e) => {
                self.note_usb_error(&e);
                Err(e.into())
            },
        }
    }

    fn set_fan_speed(&self, percent: u16) -> Result<(), BoardError> {
        self.control_out(BREQ_FAN_SET, percent, 0, &[])
    }

    fn get_fan_speed(&self) -> Result<u16, BoardError> {
        let raw = self.control_in(BREQ_FAN_GET, 0, 0, 2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn set_ir_pwr(&self, percent: u16) -> Result<(), BoardError> {
        self.control_out(BREQ_IR_PWR, percent, 0, &[])
    }

    fn send_heartbeat(&self) -> Result<(), BoardError> {
        self.control_out(BREQ_HEARTBEAT, 0, 0, &[])
    }

    fn serial_read(&self, port: u8) -> Result<Vec<u8>, BoardError> {
        let mut out = Vec::new();
        // 每次最多取 64 字节，短应答说明缓冲区已空
        loop {
            self.ensure_connected()?;
            let mut chunk = vec![0u8; 64];
            let len = match self.handle.read_control(
                REQ_IN,
                BREQ_UART_READ,
                0,
                u16::from(port),
                &mut chunk,
                CONTROL_TIMEOUT,
            ) {
                Ok(len) => {
                    self.note_usb_ok();
                    len
                },
                Err(rusb::Error::Timeout) => break,
                Err(e) => {
                    self.note_usb_error(&e);
                    return Err(e.into());
                },
            };
            out.extend_from_slice(&chunk[..len]);
            if len < chunk.len() {
                break;
            }
        }
        Ok(out)
    }

    fn serial_write(&self, port: u8, data: &[u8]) -> Result<(), BoardError> {
        self.control_out(BREQ_UART_WRITE, u16::from(port), 0, data)
    }

    fn set_gps_power(&self, on: bool) -> Result<(), BoardError> {
        self.control_out(BREQ_GPS_POWER, on as u16, 0, &[])
    }
}

impl Drop for UsbBoard {
    fn drop(&mut self) {
        // 交还接口给操作系统；会话销毁过程中失败也无所谓
        let _ = self.handle.release_interface(0);
        trace!("board {}: USB interface released", self.serial);
    }
}
