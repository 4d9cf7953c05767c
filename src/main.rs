#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use bootloader::{entry_point, BootInfo};
    use core::panic::PanicInfo;
    use triton::{hlt_loop, kerror, klog};

    entry_point!(kernel_main);

    fn kernel_main(boot_info: &'static BootInfo) -> ! {
        triton::init(boot_info);
        klog!("boot: waiting for the first scheduler tick");
        // The first PIT tick starts terminal 0's shell and abandons
        // this boot context for good.
        hlt_loop();
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        if let Some(loc) = info.location() {
            kerror!("PANIC at {}:{}:{} - {}", loc.file(), loc.line(), loc.column(), info);
        } else {
            kerror!("PANIC: {}", info);
        }
        hlt_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
