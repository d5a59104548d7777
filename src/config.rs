// 内核布局与体系结构常量

/// 页大小 4KiB，整个内核只支持这一种页
pub const PAGE_SIZE: usize = 0x1000;
/// 页内偏移位宽
pub const PAGE_SIZE_BITS: usize = 0xc;

/// Sv39 虚拟地址上限，达到或超过此值的地址在碰页表之前就被拒绝
/// 虽然 Sv39 名义上有 39 位，但 38 位以上要求符号扩展，内核只用低半部分
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// 系统支持的硬件线程数上限，启动栈按这个数目预留
pub const MAX_HARTS: usize = 8;

/// 物理内存结束地址
pub const MEMORY_END: usize = 0x8080_0000;
/// 内核堆大小
pub const KERNEL_HEAP_SIZE: usize = 0x30_0000;

// qemu virt 机器的设备地址，内核只负责把这些窗口映射进地址空间，
// 寄存器的含义由各自的驱动解释

/// UART0 寄存器页
pub const UART0: usize = 0x1000_0000;
/// 发送保持寄存器偏移
pub const UART_THR: usize = 0x0;
/// 线路状态寄存器偏移
pub const UART_LSR: usize = 0x5;
/// LSR 中的发送空闲位
pub const UART_LSR_TX_IDLE: u8 = 0x20;

/// PLIC 寄存器窗口基址
pub const PLIC: usize = 0x0c00_0000;
/// PLIC 寄存器窗口大小，跨多个页
pub const PLIC_SPAN: usize = 0x40_0000;

/// CLINT 基址，定时器比较寄存器都在这里
/// 定时器属于 M 态，内核不映射它，只是把常量备在这里给启动代码用
pub const CLINT: usize = 0x200_0000;
/// mtime 寄存器地址
pub const CLINT_MTIME: usize = CLINT + 0xbff8;

/// 第 id 个硬件线程的 mtimecmp 寄存器地址
pub const fn clint_mtimecmp(hart_id: usize) -> usize {
    CLINT + 0x4000 + 8 * hart_id
}
