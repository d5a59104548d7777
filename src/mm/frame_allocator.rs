// 物理页帧分配器，内核中所有物理页帧的唯一来源
// 任何一个页帧在任意时刻只有一个逻辑属主：要么是某个页表节点的 FrameTracker，
// 要么是某个逻辑段的数据页。页帧经由 FrameTracker 交接，不存在裸的页号流转

use super::PhysPageNum;
use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};
use lazy_static::*;
use spin::Mutex;

// 物理页帧的RAII句柄，利用生命周期自动归还
pub struct FrameTracker {
    pub ppn: PhysPageNum,
}

impl FrameTracker {
    pub fn new(ppn: PhysPageNum) -> Self {
        // 上一任属主可能留下垃圾值，接手时先清零
        let bytes_array = ppn.get_bytes_array();
        for i in bytes_array {
            *i = 0;
        }
        Self { ppn }
    }
}

impl Debug for FrameTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FrameTracker:PPN={:#x}", self.ppn.0))
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        frame_dealloc(self.ppn);
    }
}

// 物理页帧分配器接口
trait FrameAllocator {
    fn new() -> Self;
    fn alloc(&mut self) -> Option<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

// 栈式物理页帧分配器
pub struct StackFrameAllocator {
    current: usize,        // 未分配区间的起始页号
    end: usize,            // 未分配区间的结束页号
    recycled: Vec<usize>,  // 回收的页号
}

impl StackFrameAllocator {
    pub fn init(&mut self, l: PhysPageNum, r: PhysPageNum) {
        self.current = l.0;
        self.end = r.0;
    }
    // 当前还能分出去多少页
    pub fn remain(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn new() -> Self {
        Self {
            current: 0,
            end: 0,
            recycled: Vec::new(),
        }
    }
    fn alloc(&mut self) -> Option<PhysPageNum> {
        if let Some(ppn) = self.recycled.pop() {
            Some(ppn.into())
        } else if self.current == self.end {
            None
        } else {
            self.current += 1;
            Some((self.current - 1).into())
        }
    }
    fn dealloc(&mut self, ppn: PhysPageNum) {
        let ppn = ppn.0;
        // validity check
        if ppn >= self.current || self.recycled.iter().any(|v| *v == ppn) {
            panic!("Frame ppn={:#x} has not been allocated!", ppn);
        }
        // recycle
        self.recycled.push(ppn);
    }
}

type FrameAllocatorImpl = StackFrameAllocator;

lazy_static! {
    // 全局物理页帧分配器
    // 各个硬件线程都会并发地申请和归还页帧，所以用自旋互斥量兜住
    pub static ref FRAME_ALLOCATOR: Mutex<FrameAllocatorImpl> =
        Mutex::new(FrameAllocatorImpl::new());
}

// 内核自身代码和堆占掉了低处，能拿来分配的是内核镜像结尾到物理内存结尾的部分
#[cfg(target_arch = "riscv64")]
pub fn init_frame_allocator() {
    use super::PhysAddr;
    extern "C" {
        fn ekernel();
    }
    FRAME_ALLOCATOR.lock().init(
        PhysAddr::from(ekernel as usize).ceil(),
        PhysAddr::from(crate::config::MEMORY_END).floor(),
    );
}

// 申请物理页帧的接口
pub fn frame_alloc() -> Option<FrameTracker> {
    FRAME_ALLOCATOR.lock().alloc().map(FrameTracker::new)
}

// 归还页帧，只该由 FrameTracker 的析构调用
fn frame_dealloc(ppn: PhysPageNum) {
    FRAME_ALLOCATOR.lock().dealloc(ppn);
}

// 剩余可分配页数，给测试和想做准入检查的调用者用
pub fn frame_remain_num() -> usize {
    FRAME_ALLOCATOR.lock().remain()
}
