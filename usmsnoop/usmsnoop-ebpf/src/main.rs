#![no_std]
#![no_main]

use aya_ebpf::{bindings::TC_ACT_PIPE, macros::classifier, programs::TcContext};
use usmsnoop_ebpf::{capture_segment, is_tcp};

#[classifier]
pub fn usmsnoop(ctx: TcContext) -> i32 {
    if let Ok(true) = is_tcp(&ctx) {
        capture_segment(&ctx);
    }
    TC_ACT_PIPE
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
