//! 安全设定任务
//!
//! 每个点火周期最多运行一次，把板卡从诊断模式一路推进到车型安全模型：
//! `Elm327`（开放 OBD，等 VIN）→ `Elm327` 锁定（VIN 查询结束）→
//! 目标 `(model, param)`（控制栈就绪后）。
//!
//! 运行标志由状态环路置位、由本任务清零；`FlagGuard` 保证任何退出
//! 路径都会清零。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::board::{Board, BoardProvider, CarParams, SafetyModel};
use crate::params;
use crate::supervisor::Supervisor;

/// 参数仓库轮询周期
const PARAM_POLL: Duration = Duration::from_millis(100);

/// Drop 时清零标志
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn safety_setter<P>(sup: &Arc<Supervisor<P>>)
where
    P: BoardProvider + 'static,
{
    info!("starting safety setter");
    let _guard = FlagGuard(&sup.safety_setter_running);

    // 先进诊断模式：VIN 查询需要开放的 OBD 通道
    command_both(sup, SafetyModel::Elm327, 0);

    // 等车型识别进程读出 VIN
    loop {
        if !sup.workers_alive() {
            return;
        }
        if let Some(vin) = sup.params.get(params::CAR_VIN) {
            if !vin.is_empty() {
                // VIN 固定 17 字符，长度不对说明上游写坏了
                assert!(vin.len() == 17, "CarVin must be 17 bytes, got {}", vin.len());
                info!("got CarVin {}", String::from_utf8_lossy(&vin));
                break;
            }
        }
        thread::sleep(PARAM_POLL);
    }

    // VIN 查询结束，关掉 OBD 监听
    command_both(sup, SafetyModel::Elm327, 1);

    info!("waiting for params to set safety model");
    let raw_params = loop {
        if !sup.workers_alive() {
            return;
        }
        if sup.params.get_bool(params::CONTROLS_READY) {
            if let Some(raw) = sup.params.get(params::CAR_PARAMS) {
                if !raw.is_empty() {
                    break raw;
                }
            }
        }
        thread::sleep(PARAM_POLL);
    };
    info!("got {} bytes CarParams", raw_params.len());

    let Some(car_params) = CarParams::decode(&raw_params) else {
        warn!("CarParams decode failed, keeping diagnostic mode");
        return;
    };

    if let Some(main) = sup.main_board() {
        if let Err(e) = main.set_unsafe_mode(0) {
            warn!("set_unsafe_mode failed: {e}");
        }
    }

    info!(
        "setting safety model: {:?} with param {}",
        car_params.safety_model, car_params.safety_param
    );
    command_both(sup, car_params.safety_model, car_params.safety_param);
}

/// 把同一安全模型下发到两块板卡
fn command_both<P>(sup: &Arc<Supervisor<P>>, model: SafetyModel, param: i16)
where
    P: BoardProvider + 'static,
{
    if let Some(main) = sup.main_board() {
        if let Err(e) = main.set_safety_model(model, param) {
            warn!("main set_safety_model({model:?}) failed: {e}");
        }
    }
    if let Some(aux) = sup.aux_board() {
        if let Err(e) = aux.set_safety_model(model, param) {
            warn!("aux set_safety_model({model:?}) failed: {e}");
        }
    }
}
