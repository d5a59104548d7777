// 多核启动
// 0号硬件线程单线程完成全局初始化，其余硬件线程在一次性启动屏障上
// 自旋等待，屏障放行之后各自做本地初始化。屏障只有"未完成→完成"
// 一次状态变迁，之后永远保持完成，晚到的等待者直接通过

use core::sync::atomic::{AtomicBool, Ordering};

// 一次性启动屏障
// complete用Release写，wait用Acquire读，屏障放行时0号硬件线程
// 在此之前做的全部初始化写入对通过屏障的线程可见
pub struct BootFlag(AtomicBool);

impl BootFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    // 全局初始化做完后由0号硬件线程调用，整个生命周期恰好一次
    pub fn complete(&self) {
        self.0.store(true, Ordering::Release);
    }

    // 自旋到屏障放行。屏障已经放行时立刻返回
    pub fn wait(&self) {
        while !self.0.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// 全局初始化是否已经完成
pub static BOOT_COMPLETE: BootFlag = BootFlag::new();

#[cfg(all(target_arch = "riscv64", not(test)))]
core::arch::global_asm!(include_str!("entry.asm"));

// 链接脚本没义务替我们清零bss，开张之前自己动手
#[cfg(target_arch = "riscv64")]
fn clear_bss() {
    extern "C" {
        fn sbss();
        fn ebss();
    }
    unsafe {
        core::slice::from_raw_parts_mut(sbss as usize as *mut u8, ebss as usize - sbss as usize)
            .fill(0);
    }
}

// 内核入口，每个硬件线程都从entry.asm跳到这里，a0带着各自的编号
#[cfg(target_arch = "riscv64")]
#[no_mangle]
pub fn rust_main(hart_id: usize) -> ! {
    if hart_id == 0 {
        clear_bss();
        crate::logging::init();
        println!("[kernel] hart 0 booting");
        crate::mm::init();
        info!(
            "physical frames remaining: {}",
            crate::mm::frame_remain_num()
        );
        BOOT_COMPLETE.complete();
    } else {
        BOOT_COMPLETE.wait();
        crate::mm::hart_init();
    }
    let cpu = crate::sync::Cpu::new(hart_id);
    info!("hart {} online", cpu.id());
    loop {
        unsafe { riscv::asm::wfi() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_unset() {
        let flag = BootFlag::new();
        assert!(!flag.is_complete());
    }

    #[test]
    fn wait_observes_writes_made_before_complete() {
        struct Shared {
            flag: BootFlag,
            data: UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            flag: BootFlag::new(),
            data: UnsafeCell::new(0),
        });
        let publisher = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                unsafe { *shared.data.get() = 0x5a5a };
                shared.flag.complete();
            })
        };
        shared.flag.wait();
        // 屏障放行之前的写入必须全部可见
        assert_eq!(unsafe { *shared.data.get() }, 0x5a5a);
        publisher.join().unwrap();
        assert!(shared.flag.is_complete());
    }

    #[test]
    fn releases_every_waiter_and_latecomers() {
        let flag = Arc::new(BootFlag::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let flag = Arc::clone(&flag);
                thread::spawn(move || flag.wait())
            })
            .collect();
        flag.complete();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        // 放行之后才来的等待者不等待
        flag.wait();
        assert!(flag.is_complete());
    }
}
