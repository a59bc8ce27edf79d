// Build a file system image: mkfs fs.img [files...]
//
// Seeds the image with the named host files, placed in the root
// directory under their base names.

use octofs::param::{FSSIZE, LOGSIZE};
use octofs::{FileDisk, ImageBuilder};
use std::env;
use std::path::Path;
use std::process;

const NINODES: u32 = 200;

fn die(msg: &str) -> ! {
    eprintln!("mkfs: {}", msg);
    process::exit(1);
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        die("Usage: mkfs fs.img [files...]");
    }

    let disk = FileDisk::create(&args[1], FSSIZE as u32)
        .unwrap_or_else(|e| die(&format!("{}: {}", args[1], e)));
    let mut builder = ImageBuilder::new(&disk, FSSIZE as u32, NINODES, LOGSIZE as u32)
        .unwrap_or_else(|e| die(&format!("layout: {}", e)));

    for arg in &args[2..] {
        let data = std::fs::read(arg).unwrap_or_else(|e| die(&format!("{}: {}", arg, e)));
        let name = Path::new(arg)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| die(&format!("{}: bad file name", arg)));
        builder
            .add_file(name, &data)
            .unwrap_or_else(|e| die(&format!("{}: {}", name, e)));
        println!("mkfs: added {} ({} bytes)", name, data.len());
    }

    let sb = builder.finish().unwrap_or_else(|e| die(&format!("finish: {}", e)));
    println!(
        "mkfs: {} blocks total, {} data, {} inodes, {} log",
        sb.size, sb.nblocks, sb.ninodes, sb.nlog
    );
}
