//! CAN 发送环路
//!
//! 消费 `sendcan` 通道，按总线号偏移路由到对应板卡。过期批次直接丢弃：
//! 控制指令的价值随时间衰减，晚到 1 秒的刹车请求比不发更危险。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::board::{Board, BoardProvider};
use crate::messaging::{Payload, RecvError};
use crate::supervisor::Supervisor;
use crate::timeutil::nanos_since_boot;

/// 批次过期阈值
const STALE_THRESHOLD_NS: u64 = 1_000_000_000;

pub(crate) fn can_send_loop<P>(sup: &Arc<Supervisor<P>>)
where
    P: BoardProvider + 'static,
{
    let mut sub = sup.hub.subscribe("sendcan");
    sub.set_timeout(Duration::from_millis(100));

    // 消息来多快就发多快
    while sup.workers_alive() {
        let msg = match sub.receive() {
            Ok(msg) => msg,
            Err(RecvError::Timeout) => continue,
            Err(RecvError::Interrupted) => {
                sup.request_exit();
                break;
            },
            Err(RecvError::Closed) => break,
        };

        let Payload::SendCan(frames) = msg.payload else {
            continue;
        };

        // 过期批次不下发
        if nanos_since_boot().saturating_sub(msg.log_mono_time) >= STALE_THRESHOLD_NS {
            debug!("dropping stale sendcan batch ({} frames)", frames.len());
            continue;
        }

        if sup.config.fake_send {
            continue;
        }

        let target = if sup.config.main_shift() == 0 {
            sup.main_board()
        } else {
            sup.aux_board()
        };
        match target {
            Some(board) => {
                if let Err(e) = board.can_send(&frames) {
                    warn!("CAN send failed: {e}");
                }
            },
            None => warn!("no board for sendcan routing"),
        }
    }
}
