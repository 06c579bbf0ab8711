//! vmm-harness CLI tool
//!
//! Boots the built-in guest program and reports where it stopped.

use std::process;

use vmm_harness::backend::{self, BackendKind};
use vmm_harness::{Harness, TransferStrategy};

fn main() {
    vmm_harness::debug::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(());
    }

    match args[1].as_str() {
        "run" => cmd_run(&args[2..])?,
        "info" => cmd_info()?,
        "help" | "--help" | "-h" => print_usage(&args[0]),
        "version" | "--version" | "-V" => print_version(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    println!(
        r#"vmm-harness - Boot a guest from real mode into paged protected mode

USAGE:
    {} <COMMAND> [OPTIONS]

COMMANDS:
    run     Boot the guest program
    info    Show backend capabilities
    help    Show this help message
    version Show version information

RUN OPTIONS:
    --backend <NAME>    emulator or kvm (default: emulator)
    --strategy <NAME>   manual or automatic far transfer (default: manual)
    --memory <KB>       RAM size in KiB (default: 1024)
    --steps <N>         Emulator instruction limit per resume
    --fpu               Also print x87/SSE registers

ENVIRONMENT:
    VMM_HARNESS_DEBUG   1, all, or a list of backend,vcpu,runner[,trace]

EXAMPLES:
    {} run
    {} run --backend kvm --strategy automatic
"#,
        program, program, program
    );
}

fn print_version() {
    println!("vmm-harness {}", env!("CARGO_PKG_VERSION"));
    let rust_version = option_env!("CARGO_PKG_RUST_VERSION")
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown");
    println!("Built with Rust {}", rust_version);
    println!("Preferred backend: {}", vmm_harness::backend_name());
}

fn cmd_info() -> Result<(), Box<dyn std::error::Error>> {
    println!("Backend Information");
    println!("===================");

    for kind in [BackendKind::Emulator, BackendKind::Kvm] {
        println!();
        if !backend::is_available(kind) {
            println!("{}: not available", kind);
            continue;
        }
        match backend::create(kind) {
            Ok(hypervisor) => {
                println!("{} (version {}):", hypervisor.name(), hypervisor.version());
                print!("{}", hypervisor.capabilities());
            }
            Err(e) => println!("{}: {}", kind, e),
        }
    }

    if !vmm_harness::is_supported() {
        println!();
        println!("Note: hardware virtualization is unavailable; the emulator is used.");
    }

    Ok(())
}

fn cmd_run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = Harness::builder();
    let mut show_fpu = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--backend" | "-b" => {
                i += 1;
                if i >= args.len() {
                    return Err("--backend requires a name".into());
                }
                builder = builder.backend(args[i].parse::<BackendKind>()?);
            }
            "--strategy" | "-s" => {
                i += 1;
                if i >= args.len() {
                    return Err("--strategy requires a name".into());
                }
                builder = builder.strategy(args[i].parse::<TransferStrategy>()?);
            }
            "--memory" | "-m" => {
                i += 1;
                if i >= args.len() {
                    return Err("--memory requires a number".into());
                }
                let kb: u64 = args[i].parse()?;
                builder = builder.ram_size(kb * 1024);
            }
            "--steps" => {
                i += 1;
                if i >= args.len() {
                    return Err("--steps requires a number".into());
                }
                builder = builder.step_limit(args[i].parse()?);
            }
            "--fpu" => {
                show_fpu = true;
            }
            other => {
                return Err(format!("Unknown option: {}", other).into());
            }
        }
        i += 1;
    }

    let report = builder.build()?.run()?;
    println!("{}", report);
    if show_fpu {
        println!();
        println!("{}", report.fpu);
    }

    if !report.passed() {
        return Err("guest did not stop in the expected state".into());
    }
    Ok(())
}
