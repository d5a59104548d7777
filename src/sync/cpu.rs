// 每个硬件线程的本地状态
// 关中断深度和自旋锁的配对关系记在这里。谁的状态谁自己拿着：
// 本结构由各硬件线程在启动时各建一份，以 &Cpu 的形式一路传给
// 需要它的调用，不经过任何全局查找，也就永远不会拿错别人的账本

use core::cell::Cell;

pub struct Cpu {
    hart_id: usize,
    // push_off的嵌套深度
    noff: Cell<u32>,
    // 最外层push_off之前中断是否开着，配对的最后一个pop_off按它恢复
    intena: Cell<bool>,
    // 宿主机上没有sstatus寄存器，用一个开关模拟中断使能位
    #[cfg(not(target_arch = "riscv64"))]
    sie_sim: Cell<bool>,
}

impl Cpu {
    // 启动早期中断尚未开启，初值与硬件状态一致
    pub fn new(hart_id: usize) -> Self {
        Self {
            hart_id,
            noff: Cell::new(0),
            intena: Cell::new(false),
            #[cfg(not(target_arch = "riscv64"))]
            sie_sim: Cell::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.hart_id
    }

    // 本线程的中断使能位。读写的都是自己的状态，不涉及别的线程
    #[cfg(target_arch = "riscv64")]
    pub fn intr_get(&self) -> bool {
        riscv::register::sstatus::read().sie()
    }
    #[cfg(target_arch = "riscv64")]
    pub fn intr_on(&self) {
        unsafe { riscv::register::sstatus::set_sie() };
    }
    #[cfg(target_arch = "riscv64")]
    pub fn intr_off(&self) {
        unsafe { riscv::register::sstatus::clear_sie() };
    }

    #[cfg(not(target_arch = "riscv64"))]
    pub fn intr_get(&self) -> bool {
        self.sie_sim.get()
    }
    #[cfg(not(target_arch = "riscv64"))]
    pub fn intr_on(&self) {
        self.sie_sim.set(true);
    }
    #[cfg(not(target_arch = "riscv64"))]
    pub fn intr_off(&self) {
        self.sie_sim.set(false);
    }

    // 关中断并把深度加一。只在最外层记下进来之前的使能状态，
    // 嵌套的关中断区间全部退出之前绝不把中断开回来
    pub fn push_off(&self) {
        let old = self.intr_get();
        self.intr_off();
        if self.noff.get() == 0 {
            self.intena.set(old);
        }
        self.noff.set(self.noff.get() + 1);
    }

    // 深度减一，减到零时恢复最外层记下的使能状态
    // 中断已经开着或者深度已经是零，都说明调用没有配对，panic
    pub fn pop_off(&self) {
        assert!(!self.intr_get(), "pop_off - interruptible");
        let noff = self.noff.get();
        if noff < 1 {
            panic!("pop_off");
        }
        self.noff.set(noff - 1);
        if noff == 1 && self.intena.get() {
            self.intr_on();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_push_off_restores_outermost_state() {
        let cpu = Cpu::new(0);
        cpu.intr_on();
        cpu.push_off();
        assert!(!cpu.intr_get());
        cpu.push_off();
        cpu.pop_off();
        // 还有一层没退出，中断必须保持关闭
        assert!(!cpu.intr_get());
        cpu.pop_off();
        assert!(cpu.intr_get());
    }

    #[test]
    fn pop_off_keeps_interrupts_off_if_they_were_off() {
        let cpu = Cpu::new(0);
        assert!(!cpu.intr_get());
        cpu.push_off();
        cpu.pop_off();
        // 进来之前就是关的，出去之后还得是关的
        assert!(!cpu.intr_get());
    }

    #[test]
    #[should_panic(expected = "pop_off")]
    fn unmatched_pop_off_is_fatal() {
        let cpu = Cpu::new(0);
        cpu.pop_off();
    }

    #[test]
    #[should_panic(expected = "pop_off - interruptible")]
    fn pop_off_with_interrupts_on_is_fatal() {
        let cpu = Cpu::new(0);
        cpu.push_off();
        cpu.intr_on(); // 有人在关中断区间里私自开了中断
        cpu.pop_off();
    }
}
