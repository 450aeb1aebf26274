//! CAN 批量报文编解码
//!
//! `can` 通道上传输的字节就是这里定义的批量格式：板卡接入层负责编码，
//! 监督运行时原样转发，订阅方（或测试）再解码。单帧记录布局：
//!
//! ```text
//! +--------------+-----+-----+--------------+
//! | address: u32 | bus | len | data[len]    |
//! |  (LE)        | u8  | u8  | 0..=64 bytes |
//! +--------------+-----+-----+--------------+
//! ```
//!
//! 扩展帧（29-bit ID）在 `address` 的最高位置 1 标记。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 扩展帧标记位
const EXTENDED_FLAG: u32 = 1 << 31;

/// 单帧最大数据长度（CAN FD 上限）
pub const MAX_FRAME_DATA: usize = 64;

/// 帧头固定长度：address(4) + bus(1) + len(1)
const RECORD_HEADER: usize = 6;

/// 编解码错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// 缓冲区在一条记录中间被截断
    #[error("Truncated record at offset {offset}")]
    Truncated { offset: usize },

    /// 记录声明的数据长度超过上限
    #[error("Frame data too long: {len} bytes (max {MAX_FRAME_DATA})")]
    DataTooLong { len: usize },
}

/// 一条 CAN 帧
///
/// 设计要点：
/// - `bus` 已经包含总线号偏移，下游看到的是统一的 0/1/2 编号
/// - `data` 对本进程完全不透明，永远不做内容解析
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN ID（标准帧或扩展帧）
    pub address: u32,
    /// 逻辑总线号（含偏移）
    pub bus: u8,
    /// 是否为扩展帧（29-bit ID）
    pub extended: bool,
    /// 帧数据
    pub data: Vec<u8>,
}

impl CanFrame {
    /// 创建标准帧
    pub fn new(address: u32, bus: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            bus,
            extended: false,
            data: data.into(),
        }
    }
}

/// 把一批帧追加编码到 `out`，返回编码的帧数
///
/// 数据超长的帧会被截断到 [`MAX_FRAME_DATA`]。
pub fn encode_can_batch(frames: &[CanFrame], out: &mut BytesMut) -> usize {
    for frame in frames {
        let len = frame.data.len().min(MAX_FRAME_DATA);
        let mut address = frame.address & !EXTENDED_FLAG;
        if frame.extended {
            address |= EXTENDED_FLAG;
        }
        out.reserve(RECORD_HEADER + len);
        out.put_u32_le(address);
        out.put_u8(frame.bus);
        out.put_u8(len as u8);
        out.put_slice(&frame.data[..len]);
    }
    frames.len()
}

/// 解码一段批量字节
pub fn decode_can_batch(raw: &[u8]) -> Result<Vec<CanFrame>, CodecError> {
    let mut buf = Bytes::copy_from_slice(raw);
    let total = raw.len();
    let mut frames = Vec::new();

    while buf.has_remaining() {
        let offset = total - buf.remaining();
        if buf.remaining() < RECORD_HEADER {
            return Err(CodecError::Truncated { offset });
        }
        let address = buf.get_u32_le();
        let bus = buf.get_u8();
        let len = buf.get_u8() as usize;
        if len > MAX_FRAME_DATA {
            return Err(CodecError::DataTooLong { len });
        }
        if buf.remaining() < len {
            return Err(CodecError::Truncated { offset });
        }
        let data = buf.copy_to_bytes(len).to_vec();
        frames.push(CanFrame {
            address: address & !EXTENDED_FLAG,
            bus,
            extended: address & EXTENDED_FLAG != 0,
            data,
        });
    }

    Ok(frames)
}
