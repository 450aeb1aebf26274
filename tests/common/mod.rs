//! 集成测试共用的 mock 板卡
//!
//! `BoardScript` 是测试侧的剧本：预置健康快照和接收数据，记录全部
//! 下发命令。命令会回写到健康快照里（模拟固件的真实反馈），这样
//! 状态环路的收敛行为可以端到端验证。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use panda_bridge::board::{
    Board, BoardDeviceError, BoardDeviceErrorKind, BoardError, BoardProvider, HealthSnapshot,
    HwType, RtcTime, SafetyModel, UsbPowerMode,
};
use panda_bridge::messaging::codec::{self, CanFrame};

/// 单块 mock 板卡的剧本与录制结果
pub struct BoardScript {
    pub serial: String,
    pub hw_type: HwType,
    pub connected: AtomicBool,
    pub health: Mutex<HealthSnapshot>,
    pub rtc: Mutex<RtcTime>,

    // ── 录制的命令 ──
    pub safety_commands: Mutex<Vec<(SafetyModel, i16)>>,
    pub power_save_commands: Mutex<Vec<bool>>,
    pub usb_power_modes: Mutex<Vec<UsbPowerMode>>,
    pub unsafe_modes: Mutex<Vec<u16>>,
    pub fan_commands: Mutex<Vec<u16>>,
    pub ir_commands: Mutex<Vec<u16>>,
    pub rtc_writes: Mutex<Vec<RtcTime>>,
    pub gps_power_commands: Mutex<Vec<bool>>,
    pub heartbeats: AtomicU32,
    pub open_count: AtomicU32,

    // ── 预置的数据 ──
    pub rx_batches: Mutex<VecDeque<Vec<CanFrame>>>,
    pub sent_batches: Mutex<Vec<Vec<CanFrame>>>,
    pub uart_data: Mutex<VecDeque<Vec<u8>>>,
    pub uart_writes: Mutex<Vec<Vec<u8>>>,
}

impl BoardScript {
    pub fn new(serial: &str, hw_type: HwType) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.to_string(),
            hw_type,
            connected: AtomicBool::new(true),
            health: Mutex::new(HealthSnapshot::default()),
            rtc: Mutex::new(RtcTime::default()),
            safety_commands: Mutex::new(Vec::new()),
            power_save_commands: Mutex::new(Vec::new()),
            usb_power_modes: Mutex::new(Vec::new()),
            unsafe_modes: Mutex::new(Vec::new()),
            fan_commands: Mutex::new(Vec::new()),
            ir_commands: Mutex::new(Vec::new()),
            rtc_writes: Mutex::new(Vec::new()),
            gps_power_commands: Mutex::new(Vec::new()),
            heartbeats: AtomicU32::new(0),
            open_count: AtomicU32::new(0),
            rx_batches: Mutex::new(VecDeque::new()),
            sent_batches: Mutex::new(Vec::new()),
            uart_data: Mutex::new(VecDeque::new()),
            uart_writes: Mutex::new(Vec::new()),
        })
    }

    /// 修改健康快照
    pub fn with_health(self: &Arc<Self>, f: impl FnOnce(&mut HealthSnapshot)) -> &Arc<Self> {
        f(&mut self.health.lock().unwrap());
        self
    }

    /// 设置点火线电平
    pub fn set_ignition_line(&self, on: bool) {
        self.health.lock().unwrap().ignition_line = on as u8;
    }

    /// 拔线
    pub fn yank(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn last_safety_command(&self) -> Option<(SafetyModel, i16)> {
        self.safety_commands.lock().unwrap().last().copied()
    }
}

/// mock 板卡会话（只是剧本的句柄）
pub struct MockBoard(pub Arc<BoardScript>);

impl MockBoard {
    fn script(&self) -> &BoardScript {
        &self.0
    }
}

impl Board for MockBoard {
    fn hw_type(&self) -> HwType {
        self.script().hw_type
    }

    fn usb_serial(&self) -> &str {
        &self.script().serial
    }

    fn connected(&self) -> bool {
        self.script().connected.load(Ordering::SeqCst)
    }

    fn comms_healthy(&self) -> bool {
        self.connected()
    }

    fn has_rtc(&self) -> bool {
        self.script().hw_type.has_rtc()
    }

    fn get_firmware_version(&self) -> Result<[u8; 8], BoardError> {
        Ok([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03])
    }

    fn get_serial(&self) -> Result<String, BoardError> {
        Ok(self.script().serial.clone())
    }

    fn set_usb_power_mode(&self, mode: UsbPowerMode) -> Result<(), BoardError> {
        self.script().usb_power_modes.lock().unwrap().push(mode);
        self.script().health.lock().unwrap().usb_power_mode = mode;
        Ok(())
    }

    fn set_safety_model(&self, model: SafetyModel, param: i16) -> Result<(), BoardError> {
        self.script().safety_commands.lock().unwrap().push((model, param));
        let mut health = self.script().health.lock().unwrap();
        health.safety_model = model;
        health.safety_param = param;
        Ok(())
    }

    fn set_unsafe_mode(&self, mode: u16) -> Result<(), BoardError> {
        self.script().unsafe_modes.lock().unwrap().push(mode);
        Ok(())
    }

    fn set_power_saving(&self, enable: bool) -> Result<(), BoardError> {
        self.script().power_save_commands.lock().unwrap().push(enable);
        self.script().health.lock().unwrap().power_save_enabled = enable;
        Ok(())
    }

    fn set_loopback(&self, _enable: bool) -> Result<(), BoardError> {
        Ok(())
    }

    fn get_rtc(&self) -> Result<RtcTime, BoardError> {
        Ok(*self.script().rtc.lock().unwrap())
    }

    fn set_rtc(&self, time: RtcTime) -> Result<(), BoardError> {
        self.script().rtc_writes.lock().unwrap().push(time);
        *self.script().rtc.lock().unwrap() = time;
        Ok(())
    }

    fn get_state(&self) -> Result<HealthSnapshot, BoardError> {
        if !self.connected() {
            return Err(BoardError::NotConnected);
        }
        Ok(self.script().health.lock().unwrap().clone())
    }

    fn can_receive(&self, out: &mut BytesMut, bus_shift: u8) -> Result<usize, BoardError> {
        if !self.connected() {
            return Err(BoardError::NotConnected);
        }
        let Some(mut frames) = self.script().rx_batches.lock().unwrap().pop_front() else {
            return Ok(0);
        };
        for frame in &mut frames {
            frame.bus += bus_shift;
        }
        Ok(codec::encode_can_batch(&frames, out))
    }

    fn can_send(&self, frames: &[CanFrame]) -> Result<(), BoardError> {
        if !self.connected() {
            return Err(BoardError::NotConnected);
        }
        self.script().sent_batches.lock().unwrap().push(frames.to_vec());
        Ok(())
    }

    fn set_fan_speed(&self, percent: u16) -> Result<(), BoardError> {
        self.script().fan_commands.lock().unwrap().push(percent);
        Ok(())
    }

    fn get_fan_speed(&self) -> Result<u16, BoardError> {
        Ok(0)
    }

    fn set_ir_pwr(&self, percent: u16) -> Result<(), BoardError> {
        self.script().ir_commands.lock().unwrap().push(percent);
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<(), BoardError> {
        self.script().heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn serial_read(&self, _port: u8) -> Result<Vec<u8>, BoardError> {
        Ok(self
            .script()
            .uart_data
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    fn serial_write(&self, _port: u8, data: &[u8]) -> Result<(), BoardError> {
        self.script().uart_writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn set_gps_power(&self, on: bool) -> Result<(), BoardError> {
        self.script().gps_power_commands.lock().unwrap().push(on);
        Ok(())
    }
}

/// mock 发现后端：持有一组剧本，按序列号发会话
pub struct MockProvider {
    boards: Mutex<Vec<Arc<BoardScript>>>,
}

impl MockProvider {
    pub fn new(boards: Vec<Arc<BoardScript>>) -> Self {
        Self {
            boards: Mutex::new(boards),
        }
    }
}

impl BoardProvider for MockProvider {
    type Board = MockBoard;

    fn list(&self) -> Result<Vec<String>, BoardError> {
        Ok(self
            .boards
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.serial.clone())
            .collect())
    }

    fn open(&self, serial: &str) -> Result<MockBoard, BoardError> {
        let boards = self.boards.lock().unwrap();
        match boards.iter().find(|b| b.serial == serial) {
            Some(script) => {
                // 重新打开视为新会话，恢复连接状态
                script.connected.store(true, Ordering::SeqCst);
                script.open_count.fetch_add(1, Ordering::SeqCst);
                Ok(MockBoard(Arc::clone(script)))
            },
            None => Err(BoardError::Device(BoardDeviceError::new(
                BoardDeviceErrorKind::NotFound,
                format!("no script for {serial}"),
            ))),
        }
    }
}

/// 轮询等待条件成立
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
