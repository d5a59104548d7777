// 内存管理子系统
// 地址空间的抽象（MemorySet）、多级页表（PageTable）、
// 逻辑段（MapArea）以及页帧和堆的分配器都在这里

mod address;
mod error;
mod frame_allocator;
#[cfg(target_arch = "riscv64")]
mod heap_allocator;
mod memory_set;
pub mod page_table;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use error::{MemoryError, MemoryResult, PageError};
pub use frame_allocator::{frame_alloc, frame_remain_num, FrameTracker};
#[cfg(target_arch = "riscv64")]
pub use memory_set::KERNEL_SPACE;
pub use memory_set::{MapPermission, MemorySet};
pub use page_table::{copy_in, copy_in_str, copy_out, PTEFlags, PageTable, PageTableEntry};

// 初始化内存管理子系统，启动期由0号硬件线程调用一次
// 先有堆才能有Vec，先有页帧才能建页表，顺序不能换
#[cfg(target_arch = "riscv64")]
pub fn init() {
    heap_allocator::init_heap();
    frame_allocator::init_frame_allocator();
    KERNEL_SPACE.lock().activate();
}

// 其余硬件线程在内核地址空间建好之后各自启用分页
#[cfg(target_arch = "riscv64")]
pub fn hart_init() {
    KERNEL_SPACE.lock().activate();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::frame_allocator::FRAME_ALLOCATOR;
    use super::PhysAddr;
    use crate::config::PAGE_SIZE;
    use spin::Once;
    use std::sync::{Mutex, MutexGuard};

    const ARENA_PAGES: usize = 512;

    static ARENA: Once<()> = Once::new();
    static SERIAL: Mutex<()> = Mutex::new(());

    // 宿主机上没有裸的物理内存，租一块堆内存顶上：
    // 页号取自这块内存覆盖的地址区间，左移12位还原出的“物理地址”
    // 落在区间内，可以直接解引用
    pub fn init_frames() {
        ARENA.call_once(|| {
            let arena = vec![0u8; (ARENA_PAGES + 1) * PAGE_SIZE];
            let base = arena.as_ptr() as usize;
            let end = base + arena.len();
            std::mem::forget(arena);
            FRAME_ALLOCATOR
                .lock()
                .init(PhysAddr::from(base).ceil(), PhysAddr::from(end).floor());
        });
    }

    // 测试之间共享同一个全局分配器，页数断言只有串行跑才稳定
    pub fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }
}
