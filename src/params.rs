//! 键值参数仓库
//!
//! 车型识别结果、固件指纹等跨进程共享的小块状态都走这里。监督运行时
//! 只依赖 [`ParamStore`] trait；进程内实现用读写锁包一张表，生产部署
//! 可以换成任何持久化后端。
//!
//! 每个键带清除标签：点火沿到来时按标签批量清空，保证每个点火周期
//! 都基于新鲜的车型识别结果。

use std::collections::HashMap;

use parking_lot::RwLock;

// ─── 本进程用到的键 ───

/// 车辆 VIN 码（识别进程写入，固定 17 字符）
pub const CAR_VIN: &str = "CarVin";
/// 车型参数（编码见 `board::types::CarParams`）
pub const CAR_PARAMS: &str = "CarParams";
/// 控制栈就绪标志
pub const CONTROLS_READY: &str = "ControlsReady";
/// 板卡固件签名（8 字节原始值）
pub const PANDA_FIRMWARE: &str = "PandaFirmware";
/// 板卡固件签名（16 字符小写十六进制）
pub const PANDA_FIRMWARE_HEX: &str = "PandaFirmwareHex";
/// 板卡序列号
pub const PANDA_DONGLE_ID: &str = "PandaDongleId";

/// 参数清除标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTag {
    /// 点火上升沿清除
    OnIgnitionOn,
    /// 点火下降沿清除
    OnIgnitionOff,
}

/// 标签对应的键集合
fn keys_for_tag(tag: ClearTag) -> &'static [&'static str] {
    match tag {
        ClearTag::OnIgnitionOn => &[CAR_VIN, CAR_PARAMS, CONTROLS_READY],
        ClearTag::OnIgnitionOff => &[CONTROLS_READY],
    }
}

/// 参数仓库接口
pub trait ParamStore: Send + Sync {
    /// 读取原始字节；键不存在返回 `None`
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// 读取布尔值（存储形式为单字节 `b"1"` / `b"0"`）
    fn get_bool(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v == b"1")
    }

    /// 写入原始字节
    fn put(&self, key: &str, value: &[u8]);

    /// 写入布尔值
    fn put_bool(&self, key: &str, value: bool) {
        self.put(key, if value { b"1" } else { b"0" });
    }

    /// 清除带指定标签的全部键
    fn clear_all(&self, tag: ClearTag);
}

/// 进程内参数仓库
#[derive(Default)]
pub struct MemParams {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemParams {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParamStore for MemParams {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: &[u8]) {
        self.map.write().insert(key.to_owned(), value.to_vec());
    }

    fn clear_all(&self, tag: ClearTag) {
        let mut map = self.map.write();
        for key in keys_for_tag(tag) {
            map.remove(*key);
        }
    }
}
