//! CAN 接收环路
//!
//! 固定 100Hz 排空两块板卡的接收缓冲区，把批量字节原样发布到 `can`
//! 通道。节拍基于单调时钟的绝对时间推进，错拍只记录不补偿。

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use tracing::warn;

use crate::board::{Board, BoardProvider};
use crate::messaging::{Payload, PubMaster};
use crate::supervisor::Supervisor;
use crate::timeutil::nanos_since_boot;

/// 节拍周期：10ms = 100Hz
const TICK_NS: u64 = 10_000_000;

pub(crate) fn can_recv_loop<P>(sup: &Arc<Supervisor<P>>)
where
    P: BoardProvider + 'static,
{
    let pm = PubMaster::new(Arc::clone(&sup.hub), &["can"]);

    let mut next_frame_time = nanos_since_boot() + TICK_NS;

    while sup.workers_alive() {
        drain_boards(sup, &pm);

        let cur_time = nanos_since_boot();
        if next_frame_time > cur_time {
            thread::sleep(Duration::from_nanos(next_frame_time - cur_time));
        } else {
            // 错拍：重新基准到当前时刻，避免追赶式的连环爆发
            let behind = cur_time - next_frame_time;
            if sup.ignition() {
                warn!("missed cycles ({}) {}ns", behind / TICK_NS, behind);
            }
            next_frame_time = cur_time;
        }
        next_frame_time += TICK_NS;
    }
}

/// 排空一轮：先 main 后 aux，各自带上自己的总线号偏移
fn drain_boards<P>(sup: &Arc<Supervisor<P>>, pm: &PubMaster)
where
    P: BoardProvider + 'static,
{
    let Some(main) = sup.main_board() else {
        return;
    };

    let mut buf = BytesMut::new();
    match main.can_receive(&mut buf, sup.config.main_shift()) {
        Ok(_) => pm.send("can", Payload::Can(buf.freeze())),
        Err(e) => warn!("main CAN receive failed: {e}"),
    }

    if let Some(aux) = sup.aux_board() {
        let mut buf_aux = BytesMut::new();
        match aux.can_receive(&mut buf_aux, sup.config.aux_shift()) {
            Ok(_) => pm.send("can", Payload::Can(buf_aux.freeze())),
            Err(e) => warn!("aux CAN receive failed: {e}"),
        }
    }
}
