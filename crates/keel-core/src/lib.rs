#![deny(unsafe_code)]
#![doc = "keel-core: 反应器驱动的事件化网络框架核心。"]
#![doc = ""]
#![doc = "== 体系构成 =="]
#![doc = "1. 事件循环：固定规模的反应器池，每个反应器独占一个就绪选择器、"]
#![doc = "   一个任务队列与一个定时堆，在单线程上跑到终止；新通道由轮转"]
#![doc = "   分配器指派给一个反应器并终身归属。"]
#![doc = "2. 通道管道：带头尾哨兵的 Handler 双向链表，按预计算的事件掩码"]
#![doc = "   以 O(1) 跳过无关节点分发入站/出站事件，支持延迟初始化与运行期"]
#![doc = "   增删。"]
#![doc = "3. 服务器引导：在父反应器上绑定监听通道，把每条被接受的子通道"]
#![doc = "   连同选项、属性与初始化器移交给子反应器池。"]
#![doc = ""]
#![doc = "== 线程模型 =="]
#![doc = "归属某反应器的通道、管道与选择键只在该反应器的工作线程上被改写；"]
#![doc = "其它线程一律通过任务队列进入。具体传输（TCP 等）在独立 crate 中"]
#![doc = "实现本 crate 的通道与选择器契约。"]

pub mod bootstrap;
pub mod channel;
pub mod error;
pub mod executor;
pub mod future;
pub mod pipeline;
pub mod selector;
#[cfg(any(test, feature = "test-util"))]
pub mod test_stubs;

pub use error::{CoreError, Result};

/// 常用类型一站式导入。
pub mod prelude {
    pub use crate::bootstrap::ServerBootstrap;
    pub use crate::channel::{
        AttributeKey, AttributeMap, AttributeValues, Channel, ChannelConfig, ChannelCore,
        ChannelFactory, ChannelId, ChannelOption, ChannelOptions, ChannelState, PipelineMessage,
        Transport, options,
    };
    pub use crate::error::{CoreError, Result, codes};
    pub use crate::executor::{
        EventExecutor, ImmediateExecutor, Reactor, ReactorGroup, ReactorGroupBuilder,
        ScheduledHandle, Task,
    };
    pub use crate::future::{
        ChannelFuture, ChannelPromise, FutureOutcome, KeelFuture, Promise,
    };
    pub use crate::pipeline::{
        ChannelHandler, ChannelInitializer, EventMask, HandlerContext, Pipeline,
    };
    pub use crate::selector::{
        InterestSet, IoSource, ReadyEvent, ReadyOps, SelectionToken, Selector, SelectorProvider,
        SelectorWaker,
    };
}
