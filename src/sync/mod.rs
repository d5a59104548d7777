// 多核同步原语

mod cpu;
mod spinlock;

pub use cpu::Cpu;
pub use spinlock::SpinLock;
