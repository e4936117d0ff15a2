use std::env;
use std::fs;

use icsp_prog::adapter::usb::PicKit;
use icsp_prog::target::{device_name, PagePolicy, Target};

fn main() {
    env_logger::init();

    let adapter = PicKit::open().expect("adapter");
    let mut target = Target::begin(adapter).expect("begin");

    let id = target.identify(None).expect("identify");
    println!("device {:08x} ({})", id, device_name(id).unwrap_or("unknown"));

    if let Some(path) = env::args().nth(1) {
        let image = fs::read(&path).expect("read image");
        target.erase().expect("erase");
        let programmed = target
            .program(0x1d00_0000, &image, PagePolicy::Abort)
            .expect("program");
        for report in &programmed {
            println!("{:08x}: {:?}", report.address, report.status);
        }
        let verified = target.verify(0x1d00_0000, &image).expect("verify");
        println!(
            "verify: {}/{} pages ok",
            verified.iter().filter(|r| r.is_ok()).count(),
            verified.len()
        );
    }

    target.end().expect("end");
}
