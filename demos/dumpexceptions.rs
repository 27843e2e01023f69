use std::{fs::File, io::Read};

use coffview::x86_64::{UnwindInfo, UnwindInfoTrailer};
use coffview::PeImage64;

fn main() {
    let mut args = std::env::args_os().skip(1);
    if args.len() < 1 {
        eprintln!("Usage: {} <path>", std::env::args().next().unwrap());
        std::process::exit(1);
    }
    let path = args.next().unwrap();

    let mut data = Vec::new();
    let mut file = File::open(path).unwrap();
    file.read_to_end(&mut data).unwrap();
    let data = &data[..];

    let image = PeImage64::parse(data).expect("Could not parse PE image");
    let functions = image.exception_directory();
    println!(
        "Image base {:#x}, {} functions in the exception directory",
        image.image_base(),
        functions.len()
    );
    if functions.trailing_bytes() != 0 {
        println!(
            "({} trailing bytes after the last entry)",
            functions.trailing_bytes()
        );
    }
    println!();

    for function in functions.iter() {
        println!(
            "{:08x}..{:08x} unwind info at {:08x}",
            function.begin_address(),
            function.end_address(),
            function.unwind_info_address()
        );
        let Some(info_data) = image.data_at_rva(function.unwind_info_address()) else {
            println!("  <unwind info not backed by file data>");
            continue;
        };
        let info = match UnwindInfo::parse(info_data) {
            Ok(info) => info,
            Err(e) => {
                println!("  <{}>", e);
                continue;
            }
        };
        if let Some(reg) = info.frame_register() {
            println!("  frame register {} at rsp+{:#x}", reg.name(), info.frame_offset());
        }
        for operation in info.operations() {
            match operation {
                Ok((prolog_offset, operation)) => println!("  {:02x} {}", prolog_offset, operation),
                Err(e) => println!("  <{}>", e),
            }
        }
        match info.trailer() {
            Some(UnwindInfoTrailer::Chained(parent)) => {
                println!("  chained to {:08x}", parent.begin_address())
            }
            Some(UnwindInfoTrailer::ExceptionHandler { handler_rva, .. }) => {
                println!("  exception handler {:08x}", handler_rva)
            }
            Some(UnwindInfoTrailer::TerminationHandler { handler_rva, .. }) => {
                println!("  termination handler {:08x}", handler_rva)
            }
            None => {}
        }
    }
}
