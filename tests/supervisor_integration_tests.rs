//! 监督运行时端到端集成测试
//!
//! 用 mock 板卡后端驱动完整的连接/环路/拆除流程，验证点火状态机、
//! 安全模型迁移、CAN 路由和掉线恢复。

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

use common::{BoardScript, MockProvider, wait_until};
use panda_bridge::board::{CarParams, HwType, SafetyModel, UsbPowerMode};
use panda_bridge::messaging::codec::{CanFrame, decode_can_batch};
use panda_bridge::messaging::{
    DeviceStateMsg, DriverCameraStateMsg, Message, MessageHub, Payload, SubSocket,
};
use panda_bridge::params::{self, ParamStore};
use panda_bridge::timeutil::nanos_since_boot;
use panda_bridge::{MemParams, RuntimeConfig, Supervisor};

/// 一套跑起来的监督器与它的外设
struct TestRig {
    sup: Arc<Supervisor<MockProvider>>,
    hub: Arc<MessageHub>,
    params: Arc<MemParams>,
    handle: Option<JoinHandle<()>>,
}

impl TestRig {
    fn launch(boards: Vec<Arc<BoardScript>>, config: RuntimeConfig) -> Self {
        let hub = MessageHub::new();
        let params = Arc::new(MemParams::new());
        let store: Arc<dyn ParamStore> = params.clone();
        let sup = Supervisor::new(MockProvider::new(boards), Arc::clone(&hub), store, config);
        let runner = Arc::clone(&sup);
        let handle = std::thread::spawn(move || runner.run());
        Self {
            sup,
            hub,
            params,
            handle: Some(handle),
        }
    }

    /// 等到状态环路心跳了两拍（连接完成，各工作线程都已拉起）
    fn wait_running(&self, board: &Arc<BoardScript>) {
        assert!(
            wait_until(Duration::from_secs(5), || {
                board.heartbeats.load(Ordering::SeqCst) >= 2
            }),
            "supervisor did not reach steady state"
        );
    }

    fn shutdown(mut self) {
        self.sup.request_exit();
        if let Some(handle) = self.handle.take() {
            handle.join().expect("supervisor thread panicked");
        }
    }
}

/// 从订阅里拿满足条件的一条消息
fn receive_matching(
    sub: &SubSocket,
    timeout: Duration,
    mut pred: impl FnMut(&Message) -> bool,
) -> Option<Message> {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if let Ok(msg) = sub.receive() {
            if pred(&msg) {
                return Some(msg);
            }
        }
    }
    None
}

#[test]
fn test_keepalive_state_before_any_board() {
    let hub = MessageHub::new();
    let sub = hub.subscribe("pandaState");
    let params: Arc<dyn ParamStore> = Arc::new(MemParams::new());
    let sup = Supervisor::new(
        MockProvider::new(Vec::new()),
        Arc::clone(&hub),
        params,
        RuntimeConfig::default(),
    );
    let runner = Arc::clone(&sup);
    let handle = std::thread::spawn(move || runner.run());

    // 未连接期间只应有 Unknown 保活报文
    let msg = receive_matching(&sub, Duration::from_secs(2), |m| {
        matches!(m.payload, Payload::PandaState(_))
    })
    .expect("no keepalive pandaState");
    match msg.payload {
        Payload::PandaState(ps) => {
            assert_eq!(ps.panda_type, HwType::Unknown);
            assert!(!ps.ignition_line);
        },
        other => panic!("unexpected payload: {other:?}"),
    }

    sup.request_exit();
    handle.join().unwrap();
}

#[test]
fn test_cold_boot_ignition_off() {
    // 冷启动剧本：一块 BLACK 板，点火关，固件醒来时停在 Silent
    let board = BoardScript::new("b1", HwType::Black);
    board.with_health(|h| h.safety_model = SafetyModel::Silent);

    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    let sub = rig.hub.subscribe("pandaState");
    rig.wait_running(&board);

    // Silent 被压回 NoOutput，驻车进入省电
    assert!(wait_until(Duration::from_secs(2), || {
        board
            .safety_commands
            .lock()
            .unwrap()
            .contains(&(SafetyModel::NoOutput, 0))
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        board.power_save_commands.lock().unwrap().contains(&true)
    }));

    // 首次连接下发过充电模式
    assert!(
        board
            .usb_power_modes
            .lock()
            .unwrap()
            .contains(&UsbPowerMode::Cdp)
    );

    // 固件指纹落入参数仓库（原始字节与小写十六进制互为镜像）
    assert_eq!(
        rig.params.get(params::PANDA_FIRMWARE).unwrap(),
        vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03]
    );
    assert_eq!(
        rig.params.get(params::PANDA_FIRMWARE_HEX).unwrap(),
        b"deadbeef00010203"
    );
    assert_eq!(rig.params.get(params::PANDA_DONGLE_ID).unwrap(), b"b1");

    // 对外报文携带型号与点火状态
    let msg = receive_matching(&sub, Duration::from_secs(2), |m| {
        matches!(&m.payload, Payload::PandaState(ps) if ps.panda_type == HwType::Black)
    })
    .expect("no pandaState for connected board");
    match msg.payload {
        Payload::PandaState(ps) => {
            assert!(!ps.ignition_line);
            assert!(ps.valid);
        },
        other => panic!("unexpected payload: {other:?}"),
    }

    rig.shutdown();
}

#[test]
fn test_ignition_rising_runs_safety_setter_to_target() {
    let board = BoardScript::new("b1", HwType::Black);
    board.set_ignition_line(true);

    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);

    // 上升沿已清参数、安全设定任务已启动（停在等 VIN）
    assert!(wait_until(Duration::from_secs(2), || {
        board
            .safety_commands
            .lock()
            .unwrap()
            .contains(&(SafetyModel::Elm327, 0))
    }));

    // 车型识别进程就位
    rig.params.put(params::CAR_VIN, b"1HGCM82633A004352");
    assert!(wait_until(Duration::from_secs(1), || {
        board
            .safety_commands
            .lock()
            .unwrap()
            .contains(&(SafetyModel::Elm327, 1))
    }));

    rig.params.put(
        params::CAR_PARAMS,
        &CarParams {
            safety_model: SafetyModel::HondaNidec,
            safety_param: 0,
        }
        .encode(),
    );
    rig.params.put_bool(params::CONTROLS_READY, true);

    // 最终落在车型安全模型上
    assert!(wait_until(Duration::from_secs(2), || {
        board.last_safety_command() == Some((SafetyModel::HondaNidec, 0))
    }));
    assert!(board.unsafe_modes.lock().unwrap().contains(&0));
    assert_eq!(
        board.health.lock().unwrap().safety_model,
        SafetyModel::HondaNidec
    );

    rig.shutdown();
}

#[test]
fn test_at_most_one_safety_setter_per_cycle() {
    let board = BoardScript::new("b1", HwType::Black);
    board.set_ignition_line(true);

    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);

    // 第一次上升沿：setter 启动并卡在等 VIN
    assert!(wait_until(Duration::from_secs(2), || {
        board
            .safety_commands
            .lock()
            .unwrap()
            .contains(&(SafetyModel::Elm327, 0))
    }));

    // 点火抖动出第二个上升沿
    board.set_ignition_line(false);
    std::thread::sleep(Duration::from_millis(1200));
    board.set_ignition_line(true);
    std::thread::sleep(Duration::from_millis(1200));

    // setter 仍然只有一个实例：进诊断模式的命令只出现过一次
    let elm_starts = board
        .safety_commands
        .lock()
        .unwrap()
        .iter()
        .filter(|c| **c == (SafetyModel::Elm327, 0))
        .count();
    assert_eq!(elm_starts, 1, "second rising edge must not spawn a new setter");

    rig.shutdown();
}

#[test]
fn test_ignition_edges_clear_params() {
    let board = BoardScript::new("b1", HwType::Black);

    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);

    // 驻车时预置的识别结果在上升沿被清掉
    rig.params.put(params::CAR_VIN, b"stale-vin-goes-away");
    board.set_ignition_line(true);
    assert!(wait_until(Duration::from_secs(2), || {
        rig.params.get(params::CAR_VIN).is_none()
    }));

    // 下降沿清掉就绪标志
    rig.params.put_bool(params::CONTROLS_READY, true);
    board.set_ignition_line(false);
    assert!(wait_until(Duration::from_secs(2), || {
        !rig.params.get_bool(params::CONTROLS_READY)
    }));

    rig.shutdown();
}

#[test]
fn test_stale_sendcan_dropped_fresh_delivered() {
    let board = BoardScript::new("b1", HwType::Black);
    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);

    let frames = vec![CanFrame::new(0x2E4, 0, vec![1, 2, 3])];

    // 过期 1.5s 的批次：不许下发
    rig.hub.publish(
        "sendcan",
        Message {
            log_mono_time: nanos_since_boot().saturating_sub(1_500_000_000),
            payload: Payload::SendCan(frames.clone()),
        },
    );
    std::thread::sleep(Duration::from_millis(300));
    assert!(board.sent_batches.lock().unwrap().is_empty());

    // 新鲜批次正常送达
    rig.hub.publish(
        "sendcan",
        Message {
            log_mono_time: nanos_since_boot(),
            payload: Payload::SendCan(frames.clone()),
        },
    );
    assert!(wait_until(Duration::from_secs(1), || {
        !board.sent_batches.lock().unwrap().is_empty()
    }));
    assert_eq!(board.sent_batches.lock().unwrap()[0], frames);

    rig.shutdown();
}

#[test]
fn test_aux_can_drive_routing_and_rx_shifts() {
    // DOS 进 main，GREY 进 aux；AUX_CAN_DRIVE 交换总线号偏移
    let main = BoardScript::new("dos", HwType::Dos);
    let aux = BoardScript::new("grey", HwType::Grey);
    let config = RuntimeConfig {
        aux_can_drive: true,
        ..RuntimeConfig::default()
    };

    let rig = TestRig::launch(vec![Arc::clone(&main), Arc::clone(&aux)], config);
    let can_sub = rig.hub.subscribe("can");
    rig.wait_running(&main);

    // 发送路由到 aux（main_shift != 0）
    let frames = vec![CanFrame::new(0x1A0, 0, vec![9])];
    rig.hub.publish(
        "sendcan",
        Message {
            log_mono_time: nanos_since_boot(),
            payload: Payload::SendCan(frames.clone()),
        },
    );
    assert!(wait_until(Duration::from_secs(1), || {
        !aux.sent_batches.lock().unwrap().is_empty()
    }));
    assert!(main.sent_batches.lock().unwrap().is_empty());

    // 两块板的流量都出现在 can 通道上，总线号已统一
    main.rx_batches
        .lock()
        .unwrap()
        .push_back(vec![CanFrame::new(0x100, 0, vec![1])]);
    aux.rx_batches
        .lock()
        .unwrap()
        .push_back(vec![CanFrame::new(0x200, 0, vec![2])]);

    let mut seen_main_bus = None;
    let mut seen_aux_bus = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline
        && (seen_main_bus.is_none() || seen_aux_bus.is_none())
    {
        if let Ok(msg) = can_sub.receive() {
            if let Payload::Can(raw) = msg.payload {
                for frame in decode_can_batch(&raw).unwrap() {
                    match frame.address {
                        0x100 => seen_main_bus = Some(frame.bus),
                        0x200 => seen_aux_bus = Some(frame.bus),
                        _ => {},
                    }
                }
            }
        }
    }
    // main 偏移 3，aux 偏移 0
    assert_eq!(seen_main_bus, Some(3));
    assert_eq!(seen_aux_bus, Some(0));

    rig.shutdown();
}

#[test]
fn test_aux_mirrors_no_output_when_parked() {
    // 驻车 + main 不在 NoOutput：aux 被镜像压回 NoOutput
    let main = BoardScript::new("dos", HwType::Dos);
    main.with_health(|h| h.safety_model = SafetyModel::Elm327);
    let aux = BoardScript::new("grey", HwType::Grey);
    aux.with_health(|h| h.safety_model = SafetyModel::Elm327);

    let rig = TestRig::launch(
        vec![Arc::clone(&main), Arc::clone(&aux)],
        RuntimeConfig::default(),
    );
    rig.wait_running(&main);

    assert!(wait_until(Duration::from_secs(2), || {
        aux.safety_commands
            .lock()
            .unwrap()
            .contains(&(SafetyModel::NoOutput, 0))
    }));

    rig.shutdown();
}

#[test]
fn test_rtc_write_back_on_drift() {
    use time::OffsetDateTime;

    // DOS 带 RTC；板载时钟落后 1 小时
    let board = BoardScript::new("dos", HwType::Dos);
    let drifted = OffsetDateTime::now_utc() - time::Duration::hours(1);
    *board.rtc.lock().unwrap() = panda_bridge::board::RtcTime::from_datetime(&drifted);

    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);

    // 驻车第一拍（no_ignition_cnt == 1）就应当回写
    assert!(wait_until(Duration::from_secs(2), || {
        !board.rtc_writes.lock().unwrap().is_empty()
    }));
    let written = board.rtc_writes.lock().unwrap()[0];
    let written_dt = written.to_datetime().unwrap();
    let host = OffsetDateTime::now_utc();
    assert!((host - written_dt).whole_seconds().abs() < 10);

    rig.shutdown();
}

#[test]
fn test_rtc_write_back_skipped_within_tolerance() {
    use time::OffsetDateTime;

    // 板载时钟略超前，首拍检查时偏差仍在容差内
    let board = BoardScript::new("dos", HwType::Dos);
    *board.rtc.lock().unwrap() = panda_bridge::board::RtcTime::from_datetime(
        &(OffsetDateTime::now_utc() + time::Duration::seconds(1)),
    );

    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);

    // 偏差在 1.1s 以内：第一拍过去了也不回写
    std::thread::sleep(Duration::from_millis(800));
    assert!(board.rtc_writes.lock().unwrap().is_empty());

    rig.shutdown();
}

#[test]
fn test_gps_follows_ignition_edges() {
    let board = BoardScript::new("b1", HwType::Black);
    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    let ublox_sub = rig.hub.subscribe("ubloxRaw");
    rig.wait_running(&board);

    // 上升沿：接收机上电 + 冷启动配置写入
    board.set_ignition_line(true);
    assert!(wait_until(Duration::from_secs(2), || {
        board.gps_power_commands.lock().unwrap().contains(&true)
    }));
    assert!(wait_until(Duration::from_secs(1), || {
        !board.uart_writes.lock().unwrap().is_empty()
    }));

    // 接收机字节原样上抛
    board
        .uart_data
        .lock()
        .unwrap()
        .push_back(vec![0xB5, 0x62, 0x01, 0x07, 0x00, 0x00]);
    let msg = receive_matching(&ublox_sub, Duration::from_secs(2), |m| {
        matches!(m.payload, Payload::UbloxRaw(_))
    })
    .expect("no ubloxRaw message");
    match msg.payload {
        Payload::UbloxRaw(raw) => assert_eq!(raw.as_ref(), &[0xB5, 0x62, 0x01, 0x07, 0x00, 0x00]),
        other => panic!("unexpected payload: {other:?}"),
    }

    // 下降沿：断电
    board.set_ignition_line(false);
    assert!(wait_until(Duration::from_secs(2), || {
        board.gps_power_commands.lock().unwrap().contains(&false)
    }));

    rig.shutdown();
}

#[test]
fn test_hardware_control_fan_ir_charging() {
    let board = BoardScript::new("dos", HwType::Dos);
    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);

    let pm = panda_bridge::PubMaster::new(
        Arc::clone(&rig.hub),
        &["deviceState", "driverCameraState"],
    );

    // 风扇跟随期望转速
    pm.send(
        "deviceState",
        Payload::DeviceState(DeviceStateMsg {
            charging_disabled: false,
            fan_speed_percent_desired: 30,
        }),
    );
    assert!(wait_until(Duration::from_secs(2), || {
        board.fan_commands.lock().unwrap().contains(&30)
    }));

    // 饱和曝光 → 红外拉满（50%）
    pm.send(
        "driverCameraState",
        Payload::DriverCameraState(DriverCameraStateMsg { integ_lines: 1600 }),
    );
    assert!(wait_until(Duration::from_secs(2), || {
        board.ir_commands.lock().unwrap().contains(&50)
    }));

    // 关充电 → USB 切到 Client
    pm.send(
        "deviceState",
        Payload::DeviceState(DeviceStateMsg {
            charging_disabled: true,
            fan_speed_percent_desired: 30,
        }),
    );
    assert!(wait_until(Duration::from_secs(2), || {
        board
            .usb_power_modes
            .lock()
            .unwrap()
            .contains(&UsbPowerMode::Client)
    }));

    rig.shutdown();
}

#[test]
fn test_disconnect_recovery() {
    let board = BoardScript::new("b1", HwType::Black);
    let rig = TestRig::launch(vec![Arc::clone(&board)], RuntimeConfig::default());
    rig.wait_running(&board);
    assert_eq!(board.open_count.load(Ordering::SeqCst), 1);

    // 拔线：所有环路退出，外层销毁板卡重新发现
    board.yank();
    assert!(
        wait_until(Duration::from_secs(10), || {
            board.open_count.load(Ordering::SeqCst) >= 2
        }),
        "board was not reopened after disconnect"
    );

    // 恢复后心跳继续
    let beats_after_reconnect = board.heartbeats.load(Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(3), || {
        board.heartbeats.load(Ordering::SeqCst) > beats_after_reconnect
    }));

    rig.shutdown();
}
