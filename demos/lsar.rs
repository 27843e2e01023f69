use std::{fs::File, io::Read};

use coffview::coff::ArchiveView;

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

    let archive = ArchiveView::new(&data);
    for (name, member) in &archive {
        println!(
            "{:08x} {:>10} {}",
            member.offset(),
            member.size(),
            String::from_utf8_lossy(name)
        );
    }

    for table in archive.symbol_tables() {
        let index = match table.symbol_index() {
            Ok(index) => index,
            Err(e) => {
                println!("Bad symbol index at {:#x}: {}", table.offset(), e);
                continue;
            }
        };
        println!();
        println!("Symbol index with {} entries", index.len());
        for (symbol, offset) in index.iter() {
            let member = archive
                .member_at(offset as usize)
                .map(|(name, _)| String::from_utf8_lossy(name).into_owned())
                .unwrap_or_else(|| "<bad offset>".to_string());
            println!("{:08x} {} ({})", offset, String::from_utf8_lossy(symbol), member);
        }
    }
}
