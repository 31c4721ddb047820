use tar_stream::{TarHeader, TarResult, list, pack, unpack};
use chrono::DateTime;
use std::env;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    if let Err(e) = run(&args[1], &args[2..]) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: &str, args: &[String]) -> TarResult<()> {
    match command {
        "pack" => {
            if args.len() < 2 {
                eprintln!("Error: pack requires at least tarfile and one input file");
                print_usage();
                std::process::exit(1);
            }
            let tarfile = &args[0];
            let files: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();
            pack(tarfile, &files)?;
            println!("Created tar archive: {}", tarfile);
        }
        "unpack" => {
            if args.len() < 2 {
                eprintln!("Error: unpack requires tarfile and output directory");
                print_usage();
                std::process::exit(1);
            }
            unpack(&args[0], &args[1])?;
            println!("Extraction complete to: {}", args[1]);
        }
        "list" => {
            if args.is_empty() {
                eprintln!("Error: list requires tarfile");
                print_usage();
                std::process::exit(1);
            }
            let tarfile = &args[0];
            let headers = list(tarfile)?;
            println!("Files in {}:", tarfile);
            println!("{:>10}  {:<19}  {}", "Size", "Modified", "Name");
            println!("{}", "-".repeat(60));
            for header in &headers {
                println!("{}", format_row(header));
            }
            println!("\nTotal: {} file(s)", headers.len());
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            std::process::exit(1);
        }
    }
    Ok(())
}

/// One line of `list` output: size, mtime in UTC and name
fn format_row(header: &TarHeader) -> String {
    let modified = i64::try_from(header.mtime)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{:>10}  {:<19}  {}", header.size, modified, header.name)
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  pack <tarfile> <file1> <file2> ... - Create tar archive");
    eprintln!("  unpack <tarfile> <directory>      - Extract tar archive");
    eprintln!("  list <tarfile>                     - List files in tar archive");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_format_row() {
        let mut header = TarHeader::new("hello.txt".to_string(), 0o644, 12);
        header.mtime = 1_700_000_000;
        assert_eq!(
            format_row(&header),
            "        12  2023-11-14 22:13:20  hello.txt"
        );

        header.mtime = u64::MAX;
        assert!(format_row(&header).contains("  -  "));
    }

    #[test]
    fn test_run_commands() {
        let dir = env::temp_dir().join(format!("tar_stream_main_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let test_file = dir.join("test_main_file.txt");
        let test_tar = dir.join("test_main.tar");
        let output_dir = dir.join("output");
        fs::write(&test_file, "Main unpack test").unwrap();

        let arg = |p: &std::path::Path| p.to_string_lossy().to_string();
        run("pack", &[arg(&test_tar), arg(&test_file)]).unwrap();
        run("list", &[arg(&test_tar)]).unwrap();
        run("unpack", &[arg(&test_tar), arg(&output_dir)]).unwrap();

        let content = fs::read_to_string(output_dir.join("test_main_file.txt")).unwrap();
        assert_eq!(content, "Main unpack test");

        fs::remove_dir_all(&dir).unwrap();
    }
}
