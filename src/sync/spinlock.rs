// 多核自旋锁
// 持锁期间本线程的中断必须保持关闭，否则中断处理程序再来抢同一把锁
// 就是单核死锁，所以acquire和release与Cpu::push_off/pop_off严格配对。
// 锁记下持有者的线程号，重复加锁和越俎代庖的解锁都当场panic

use super::Cpu;
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

const NO_OWNER: usize = usize::MAX;

pub struct SpinLock {
    locked: AtomicBool,
    // 持有者的hart_id，没人持有时是NO_OWNER
    owner: AtomicUsize,
    // 锁名，只出现在panic信息里
    name: &'static str,
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            name,
        }
    }

    // 自旋到拿下锁为止
    pub fn acquire(&self, cpu: &Cpu) {
        cpu.push_off();
        assert!(!self.holding(cpu), "acquire {}", self.name);
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        // 临界区里的访问不许被提到拿锁之前
        fence(Ordering::SeqCst);
        self.owner.store(cpu.id(), Ordering::Relaxed);
    }

    pub fn release(&self, cpu: &Cpu) {
        assert!(self.holding(cpu), "release {}", self.name);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        // 临界区里的访问不许被拖到放锁之后
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
        cpu.pop_off();
    }

    // 本线程是否持有此锁。读自己的持有关系不需要再加锁，
    // 但必须在关中断状态下问，不然答案随时可能过期
    pub fn holding(&self, cpu: &Cpu) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == cpu.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    // 测试专用：把被锁保护的数据和锁放在一起，由锁的纪律保证独占
    struct Guarded {
        lock: SpinLock,
        value: UnsafeCell<u64>,
    }
    unsafe impl Sync for Guarded {}

    #[test]
    fn increments_do_not_get_lost() {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 10_000;
        let shared = Arc::new(Guarded {
            lock: SpinLock::new("counter"),
            value: UnsafeCell::new(0),
        });
        let handles: Vec<_> = (0..THREADS)
            .map(|hart_id| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let cpu = Cpu::new(hart_id);
                    for _ in 0..ROUNDS {
                        shared.lock.acquire(&cpu);
                        unsafe { *shared.value.get() += 1 };
                        shared.lock.release(&cpu);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { *shared.value.get() }, (THREADS as u64) * ROUNDS);
    }

    #[test]
    fn lock_keeps_interrupts_off_until_release() {
        let cpu = Cpu::new(0);
        let lock = SpinLock::new("test");
        cpu.intr_on();
        lock.acquire(&cpu);
        assert!(!cpu.intr_get());
        assert!(lock.holding(&cpu));
        lock.release(&cpu);
        assert!(cpu.intr_get());
        assert!(!lock.holding(&cpu));
    }

    #[test]
    #[should_panic(expected = "acquire")]
    fn reacquire_by_holder_is_fatal() {
        let cpu = Cpu::new(0);
        let lock = SpinLock::new("test");
        lock.acquire(&cpu);
        lock.acquire(&cpu);
    }

    #[test]
    #[should_panic(expected = "release")]
    fn release_without_holding_is_fatal() {
        let cpu = Cpu::new(0);
        let lock = SpinLock::new("test");
        lock.release(&cpu);
    }

    #[test]
    #[should_panic(expected = "release")]
    fn release_by_other_hart_is_fatal() {
        let holder = Cpu::new(0);
        let intruder = Cpu::new(1);
        let lock = SpinLock::new("test");
        lock.acquire(&holder);
        lock.release(&intruder);
    }
}
