//! 会话监管：单个 agent 的执行中断管理
//!
//! 每次链式执行开始时领取一个子 token；cancel 只取消当前这次执行，不影响之后的执行。
//! shutdown 取消根 token，所有执行（含之后领取的）均立即视为已取消。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    /// 当前执行的 token
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let current = Mutex::new(root.child_token());
        Self { root, current }
    }

    /// 开始一次新的执行，返回其取消令牌
    pub fn begin_run(&self) -> CancellationToken {
        let token = self.root.child_token();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }

    /// 取消当前执行（在两轮之间生效）
    pub fn cancel(&self) {
        if let Ok(current) = self.current.lock() {
            current.cancel();
        }
    }

    /// 取消全部执行（进程退出）
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_affects_current_run() {
        let s = SessionSupervisor::new();
        let first = s.begin_run();
        s.cancel();
        assert!(first.is_cancelled());
        let second = s.begin_run();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_future_runs() {
        let s = SessionSupervisor::new();
        assert!(!s.is_shutdown());
        s.shutdown();
        assert!(s.is_shutdown());
        assert!(s.begin_run().is_cancelled());
    }
}
