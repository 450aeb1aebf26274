//! 平台探测与进程调度配置
//!
//! 区分 TICI（车载 ARM 主机）/ PC，提供实时优先级、CPU 亲和性设置和
//! TICI 上的 sysfs 电压电流读数。

use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

/// TICI 上的供电电压节点（mV）
pub const HWMON_VOLTAGE_PATH: &str = "/sys/class/hwmon/hwmon1/in1_input";
/// TICI 上的供电电流节点（mA）
pub const HWMON_CURRENT_PATH: &str = "/sys/class/hwmon/hwmon1/curr1_input";

/// 运行平台
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// 车载 ARM 主机（电压电流走 sysfs，GPS 走直连串口）
    Tici,
    /// 开发机（跳过充电控制）
    Pc,
    /// 其他（按板卡上报的电压电流处理）
    Generic,
}

impl Platform {
    /// 探测当前平台
    ///
    /// TICI 镜像在根目录放了标记文件；x86_64 一律按 PC 处理。
    pub fn detect() -> Self {
        if Path::new("/TICI").exists() {
            Self::Tici
        } else if cfg!(target_arch = "x86_64") {
            Self::Pc
        } else {
            Self::Generic
        }
    }

    pub fn is_tici(self) -> bool {
        self == Self::Tici
    }

    pub fn is_pc(self) -> bool {
        self == Self::Pc
    }

    /// 本进程绑定的 CPU 核
    pub fn daemon_core(self) -> usize {
        if self.is_tici() { 4 } else { 3 }
    }
}

/// 把当前进程切到 SCHED_FIFO 实时调度
pub fn set_realtime_priority(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 把当前进程绑定到指定 CPU 核
pub fn set_core_affinity(core: usize) -> Result<(), nix::Error> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
}

/// 读取一个只含整数的 sysfs 节点
pub fn read_sysfs_u32(path: &str) -> Option<u32> {
    match fs::read_to_string(path) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("sysfs node {path} is not an integer: {raw:?}");
                None
            },
        },
        Err(e) => {
            warn!("failed to read sysfs node {path}: {e}");
            None
        },
    }
}
