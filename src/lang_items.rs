// panic处理
// 内核panic说明不变式已经被破坏，打印出事地点然后把这个硬件线程停住

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[kernel] {}", info);
    loop {
        unsafe { riscv::asm::wfi() };
    }
}
