//! GPS 环路
//!
//! 100Hz 把接收机字节泵到 `ubloxRaw` 通道，同时：
//! - 按 UBX 消息类别跟踪最近一次收包时间，超时只告警
//!   （自动复位待线上日志验证后再启用）
//! - 行驶中收到前导为空字节的数据视为接收机挂死，触发复位
//! - 点火上升沿冷启动接收机，下降沿断电

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::board::BoardProvider;
use crate::messaging::{Payload, PubMaster};
use crate::pigeon::{CLASS_NAV, CLASS_RXM, PREAMBLE1, PREAMBLE2, Pigeon};
use crate::supervisor::Supervisor;
use crate::timeutil::nanos_since_boot;

/// 环路周期：10ms = 100Hz
const TICK: Duration = Duration::from_millis(10);

/// 各消息类别的最大静默时间（纳秒）
const CLS_MAX_DT_NS: [(u8, u64); 2] = [
    (CLASS_NAV, 900_000_000), // 0.9s
    (CLASS_RXM, 900_000_000), // 0.9s
];

/// 冷启动后给接收机的收敛宽限
const STARTUP_GRACE_NS: u64 = 10_000_000_000;

pub(crate) fn gps_loop<P>(sup: &Arc<Supervisor<P>>, pigeon: &mut dyn Pigeon)
where
    P: BoardProvider + 'static,
{
    let pm = PubMaster::new(Arc::clone(&sup.hub), &["ubloxRaw"]);

    let mut ignition_last = false;
    let mut last_recv_time: HashMap<u8, u64> = HashMap::new();

    while sup.workers_alive() {
        let mut need_reset = false;
        let ignition = sup.ignition();

        let recv = match pigeon.receive() {
            Ok(recv) => recv,
            Err(e) => {
                warn!("pigeon receive failed: {e}");
                Vec::new()
            },
        };

        // 解析报文头，刷新该类别的最近收包时间
        if ignition && recv.len() >= 3 && recv[0] == PREAMBLE1 && recv[1] == PREAMBLE2 {
            let msg_cls = recv[2];
            let t = nanos_since_boot();
            let entry = last_recv_time.entry(msg_cls).or_insert(0);
            if t > *entry {
                *entry = t;
            }
        }

        // 按类别频率检查
        for (msg_cls, max_dt) in CLS_MAX_DT_NS {
            let last = last_recv_time.get(&msg_cls).copied().unwrap_or(0);
            let dt = nanos_since_boot().saturating_sub(last);
            if ignition_last && ignition && dt > max_dt {
                warn!("ublox receive timeout, msg class: 0x{msg_cls:02x}, dt {dt}ns");
                // TODO: 日志验证通过后在这里启用 need_reset = true
            }
        }

        // 空字节开头说明接收机输出已经坏掉
        if ignition && !recv.is_empty() && recv[0] == 0x00 {
            need_reset = true;
            warn!("received invalid ublox message while onroad, resetting GPS");
        }

        if !recv.is_empty() {
            pm.send("ubloxRaw", Payload::UbloxRaw(Bytes::from(recv)));
        }

        // 低功耗期间接收机被断电，点火上升沿（或挂死）要重新初始化
        if (ignition && !ignition_last) || need_reset {
            if let Err(e) = pigeon.init() {
                warn!("pigeon init failed: {e}");
            }
            let t = nanos_since_boot() + STARTUP_GRACE_NS;
            for (msg_cls, _) in CLS_MAX_DT_NS {
                last_recv_time.insert(msg_cls, t);
            }
            info!("pigeon initialized");
        } else if !ignition && ignition_last {
            debug!("powering off pigeon");
            pigeon.stop();
            if let Err(e) = pigeon.set_power(false) {
                warn!("pigeon power off failed: {e}");
            }
        }

        ignition_last = ignition;
        thread::sleep(TICK);
    }
}
