//! Panda Bridge - 车载安全协处理器主机侧桥接运行时
//!
//! 守护进程把 panda 安全协处理器接入自动驾驶软件栈：独占 USB 链路、
//! 监督板卡生命周期、把 CAN / GPS 数据转成发布订阅消息流。
//!
//! # 架构层次
//!
//! - **接入层** (`board`, `pigeon`): USB 板卡与 GPS 接收机的会话与传输
//! - **消息层** (`messaging`, `params`): 进程内发布订阅枢纽与参数仓库
//! - **监督层** (`supervisor`): 连接监督与五个工作环路的编排

pub mod board;
pub mod filters;
pub mod hardware;
pub mod messaging;
pub mod params;
pub mod pigeon;
pub mod supervisor;
pub mod timeutil;

// Re-export 核心类型（简化用户导入）
pub use board::{Board, BoardError, BoardProvider, HwType, SafetyModel, UsbBoardProvider};
pub use hardware::Platform;
pub use messaging::{MessageHub, PubMaster, SubMaster, SubSocket};
pub use params::{MemParams, ParamStore};
pub use supervisor::{RuntimeConfig, Supervisor};
