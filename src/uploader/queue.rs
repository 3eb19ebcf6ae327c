// 上传队列
//
// 纯内存的任务集合，只负责成员增删查，不做状态迁移，不发起网络请求。
// 外部观察者持有任务的 Arc 引用，clear_finished 不能改变其余任务的顺序与身份。
//
// 锁顺序：先队列锁，后任务锁；持有任务锁时不得再获取队列锁。

use crate::uploader::task::{join_logical, UploadTask, UploadTaskStatus};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// 共享任务句柄
pub type SharedTask = Arc<Mutex<UploadTask>>;

/// 上传队列
#[derive(Debug, Default)]
pub struct UploadQueue {
    tasks: RwLock<Vec<SharedTask>>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加任务，返回共享句柄
    pub fn add(&self, task: UploadTask) -> SharedTask {
        let shared = Arc::new(Mutex::new(task));
        self.tasks.write().push(shared.clone());
        shared
    }

    /// 移除任务
    pub fn remove(&self, id: &str) -> bool {
        let mut tasks = self.tasks.write();
        match tasks.iter().position(|t| t.lock().id == id) {
            Some(pos) => {
                tasks.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 按ID查找任务
    pub fn find(&self, id: &str) -> Option<SharedTask> {
        self.tasks.read().iter().find(|t| t.lock().id == id).cloned()
    }

    /// 按入队顺序查找第一个 pending 任务
    pub fn find_first_pending(&self) -> Option<SharedTask> {
        self.tasks
            .read()
            .iter()
            .find(|t| t.lock().status == UploadTaskStatus::Pending)
            .cloned()
    }

    /// 丢弃所有 success / canceled 任务，返回丢弃数量
    pub fn clear_finished(&self) -> usize {
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|t| !t.lock().status.is_terminal());
        before - tasks.len()
    }

    /// 队列中是否已有相同 (目标目录, 相对路径) 的未取消任务
    pub fn contains_path(&self, target_dir: &str, relative_path: &str) -> bool {
        let wanted = join_logical(target_dir, relative_path);
        self.tasks.read().iter().any(|t| {
            let task = t.lock();
            task.status != UploadTaskStatus::Canceled && task.logical_path() == wanted
        })
    }

    /// 按状态筛选
    pub fn with_status(&self, status: UploadTaskStatus) -> Vec<SharedTask> {
        self.tasks
            .read()
            .iter()
            .filter(|t| t.lock().status == status)
            .cloned()
            .collect()
    }

    /// 当前所有任务（保持入队顺序）
    pub fn tasks(&self) -> Vec<SharedTask> {
        self.tasks.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
