// 字符输出
// 裸机上直接操作16550串口：自旋等到线路状态寄存器报告发送空闲，
// 再把字节写进发送保持寄存器。宿主机上跑测试时转发给标准输出

use core::fmt::{self, Write};

struct Stdout;

#[cfg(target_arch = "riscv64")]
fn putchar(c: u8) {
    use crate::config::{UART0, UART_LSR, UART_LSR_TX_IDLE, UART_THR};
    unsafe {
        while core::ptr::read_volatile((UART0 + UART_LSR) as *const u8) & UART_LSR_TX_IDLE == 0 {}
        core::ptr::write_volatile((UART0 + UART_THR) as *mut u8, c);
    }
}

impl Write for Stdout {
    #[cfg(target_arch = "riscv64")]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            putchar(c);
        }
        Ok(())
    }

    #[cfg(all(not(target_arch = "riscv64"), test))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::print!("{}", s);
        Ok(())
    }

    #[cfg(all(not(target_arch = "riscv64"), not(test)))]
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

pub fn print(args: fmt::Arguments) {
    Stdout.write_fmt(args).unwrap();
}

#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?));
    }
}

#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?));
    }
}
