//! GPS 接收机（pigeon）接入层
//!
//! u-blox 接收机有两种挂载方式：
//! - 经板卡 UART 透传口（常规路径，`BoardPigeon`）
//! - 直连主机串口（TICI 平台，`TtyPigeon`）
//!
//! GPS 环路只依赖 [`Pigeon`] trait，原始字节不在这里解析，只原样上抛。

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::board::{Board, BoardError};

/// UBX 帧前导字节
pub const PREAMBLE1: u8 = 0xB5;
pub const PREAMBLE2: u8 = 0x62;

/// UBX 消息类别：导航解
pub const CLASS_NAV: u8 = 0x01;
/// UBX 消息类别：接收机管理
pub const CLASS_RXM: u8 = 0x02;

/// 板卡上 GPS 挂载的 UART 透传口号
const GPS_UART_PORT: u8 = 1;

/// CFG-RST 冷启动（清星历，整机复位）
const UBX_COLD_START: [u8; 4] = [0xFF, 0xFF, 0x02, 0x00];
/// CFG-RST 停止 GNSS
const UBX_GNSS_STOP: [u8; 4] = [0x00, 0x00, 0x08, 0x00];
/// CFG-RATE 100ms 量测周期
const UBX_RATE_100MS: [u8; 6] = [0x64, 0x00, 0x01, 0x00, 0x01, 0x00];

/// GPS 接入层错误
#[derive(Error, Debug)]
pub enum PigeonError {
    #[error("Board error: {0}")]
    Board(#[from] BoardError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// GPS 接收机接口
pub trait Pigeon: Send {
    /// 初始化接收机（冷启动 + 量测配置）
    fn init(&mut self) -> Result<(), PigeonError>;

    /// 取走当前可读的全部字节；没有数据时返回空
    fn receive(&mut self) -> Result<Vec<u8>, PigeonError>;

    /// 停止 GNSS 运算
    fn stop(&mut self);

    /// 开关接收机供电
    fn set_power(&mut self, on: bool) -> Result<(), PigeonError>;
}

/// 组装一条 UBX 报文（含前导和校验和）
///
/// Fletcher-8 校验覆盖 class、id、长度和负载。
pub fn ubx_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.push(PREAMBLE1);
    out.push(PREAMBLE2);
    out.push(class);
    out.push(id);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);

    let (mut ck_a, mut ck_b) = (0u8, 0u8);
    for byte in &out[2..] {
        ck_a = ck_a.wrapping_add(*byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    out.push(ck_a);
    out.push(ck_b);
    out
}

/// 经板卡 UART 透传口挂载的接收机
pub struct BoardPigeon<B: Board> {
    board: Arc<B>,
}

impl<B: Board> BoardPigeon<B> {
    pub fn new(board: Arc<B>) -> Self {
        Self { board }
    }
}

impl<B: Board> Pigeon for BoardPigeon<B> {
    fn init(&mut self) -> Result<(), PigeonError> {
        // 低功耗期间被断电，先恢复供电再冷启动
        self.set_power(true)?;
        self.board
            .serial_write(GPS_UART_PORT, &ubx_frame(0x06, 0x04, &UBX_COLD_START))?;
        self.board
            .serial_write(GPS_UART_PORT, &ubx_frame(0x06, 0x08, &UBX_RATE_100MS))?;
        trace!("pigeon initialized via board UART");
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, PigeonError> {
        Ok(self.board.serial_read(GPS_UART_PORT)?)
    }

    fn stop(&mut self) {
        let frame = ubx_frame(0x06, 0x04, &UBX_GNSS_STOP);
        if let Err(e) = self.board.serial_write(GPS_UART_PORT, &frame) {
            trace!("pigeon stop command failed: {e}");
        }
    }

    fn set_power(&mut self, on: bool) -> Result<(), PigeonError> {
        Ok(self.board.set_gps_power(on)?)
    }
}

/// 直连串口的接收机（TICI）
pub struct TtyPigeon {
    port: File,
}

impl TtyPigeon {
    /// 打开并配置串口（raw 模式，460800 波特，非阻塞读）
    pub fn open(path: &str) -> Result<Self, PigeonError> {
        use nix::sys::termios::{self, BaudRate, SetArg};

        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;

        let mut tio = termios::tcgetattr(&port).map_err(io::Error::from)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetispeed(&mut tio, BaudRate::B460800).map_err(io::Error::from)?;
        termios::cfsetospeed(&mut tio, BaudRate::B460800).map_err(io::Error::from)?;
        termios::tcsetattr(&port, SetArg::TCSANOW, &tio).map_err(io::Error::from)?;

        Ok(Self { port })
    }
}

impl Pigeon for TtyPigeon {
    fn init(&mut self) -> Result<(), PigeonError> {
        self.port.write_all(&ubx_frame(0x06, 0x04, &UBX_COLD_START))?;
        self.port.write_all(&ubx_frame(0x06, 0x08, &UBX_RATE_100MS))?;
        trace!("pigeon initialized via tty");
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, PigeonError> {
        let mut buf = [0u8; 1024];
        match self.port.read(&mut buf) {
            Ok(len) => Ok(buf[..len].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn stop(&mut self) {
        let frame = ubx_frame(0x06, 0x04, &UBX_GNSS_STOP);
        if let Err(e) = self.port.write_all(&frame) {
            trace!("pigeon stop command failed: {e}");
        }
    }

    fn set_power(&mut self, _on: bool) -> Result<(), PigeonError> {
        // 直连场景下电源轨不归本进程管
        Ok(())
    }
}
