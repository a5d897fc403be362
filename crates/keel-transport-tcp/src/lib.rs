#![doc = r#"
# keel-transport-tcp

## 设计动机（Why）
- **定位**：为 `keel-core` 的反应器运行时提供最小的 TCP 传输实现，
  覆盖监听、接受、读写、水位背压与关闭等底层细节。
- **架构角色**：实现核心的 `Channel`/`Transport`/`Selector` 契约——
  选择器落在 `mio::Poll` 上，套接字选项经 `socket2` 落地，管道与
  生命周期语义完全由核心驱动。

## 核心契约（What）
- **输入条件**：通道必须经 `Reactor::register_channel` 获得归属后才能
  执行出站操作；全部 IO 钩子只在归属反应器的工作线程上被调用；
- **输出保障**：读负载以引用计数的 `Bytes` 进入管道；写失败映射为带
  稳定错误码的 `CoreError` 并附带底层 `io::Error` 根因；
- **前置约束**：选择器为边沿触发，读/写/接受路径都排空到 `WouldBlock`。

## 风险与考量（Trade-offs）
- **客户端建连**：`connect` 引导不在范围内，对应操作返回
  `transport.unsupported`；
- **读租借**：按配置的接收缓冲容量整块租借，尚未引入自适应容量策略。
"#]

mod channel;
mod error;
mod listener;
mod selector;

pub use channel::TcpStreamChannel;
pub use listener::{TcpServerChannel, TcpServerChannelFactory};
pub use selector::{MioSelector, MioSelectorProvider};
