//! 一个多核RISC-V内核的地址空间与同步核心
//!
//! 内容包括：Sv39三级页表及其上的地址空间抽象、物理页帧分配器、
//! 带关中断纪律的自旋锁，以及多核启动用的一次性屏障。
//! 在riscv64目标上作为裸机内核的核心链入；在宿主机上保留完整的
//! 纯内存语义，测试直接以普通用户态程序的身份跑

#![cfg_attr(not(test), no_std)]
#![cfg_attr(all(target_arch = "riscv64", not(test)), feature(alloc_error_handler))]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
pub mod console;
pub mod boot;
pub mod config;
#[cfg(all(target_arch = "riscv64", not(test)))]
mod lang_items;
pub mod logging;
pub mod mm;
pub mod sync;
