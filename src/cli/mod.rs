pub mod commands;

use clap::{value_parser, Arg, ArgAction, Command};

pub use commands::{endpoint_from_matches, handle_subcommands};

fn address_arg() -> Arg {
    Arg::new("address")
        .help("Zero-based start address")
        .required(true)
        .value_parser(value_parser!(u16))
}

fn quantity_arg() -> Arg {
    Arg::new("quantity")
        .help("Number of registers or bits")
        .required(true)
        .value_parser(value_parser!(u16))
}

pub fn build_cli() -> Command {
    Command::new("plc-link")
        .version(crate::VERSION)
        .about("MODBUS/TCP client for reading and writing PLC registers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .help("Endpoint TOML file (overrides --host/--port/--unit)"),
        )
        .arg(Arg::new("host").long("host").global(true).help("PLC IP address"))
        .arg(
            Arg::new("port")
                .long("port")
                .global(true)
                .value_parser(value_parser!(u16))
                .help("TCP port [default: 502]"),
        )
        .arg(
            Arg::new("unit")
                .long("unit")
                .global(true)
                .value_parser(value_parser!(u8))
                .help("Unit identifier [default: 1]"),
        )
        .arg(Arg::new("name").long("name").global(true).help("Device name used in events"))
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .global(true)
                .value_parser(["console", "json", "csv"])
                .default_value("console"),
        )
        .arg(
            Arg::new("output-file")
                .short('o')
                .long("output-file")
                .global(true)
                .help("Also append formatted events to this file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging"),
        )
        .subcommand(
            Command::new("read-holding")
                .about("Read holding registers (0x03)")
                .arg(address_arg())
                .arg(quantity_arg()),
        )
        .subcommand(
            Command::new("read-input")
                .about("Read input registers (0x04)")
                .arg(address_arg())
                .arg(quantity_arg()),
        )
        .subcommand(
            Command::new("read-coils")
                .about("Read coils (0x01)")
                .arg(address_arg())
                .arg(quantity_arg()),
        )
        .subcommand(
            Command::new("read-discrete")
                .about("Read discrete inputs (0x02)")
                .arg(address_arg())
                .arg(quantity_arg()),
        )
        .subcommand(
            Command::new("write-register")
                .about("Write a single holding register (0x06)")
                .arg(address_arg())
                .arg(Arg::new("value").required(true).value_parser(value_parser!(u16))),
        )
        .subcommand(
            Command::new("write-registers")
                .about("Write consecutive holding registers (0x10)")
                .arg(address_arg())
                .arg(
                    Arg::new("values")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(u16)),
                ),
        )
        .subcommand(
            Command::new("write-coil")
                .about("Write a single coil (0x05)")
                .arg(address_arg())
                .arg(
                    Arg::new("state")
                        .required(true)
                        .value_parser(["on", "off", "true", "false", "1", "0"]),
                ),
        )
        .subcommand(
            Command::new("monitor")
                .about("Poll a register block and stream every event")
                .arg(address_arg())
                .arg(quantity_arg())
                .arg(
                    Arg::new("table")
                        .long("table")
                        .value_parser(["holding", "input", "coils", "discrete"])
                        .default_value("holding"),
                )
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .value_parser(value_parser!(u64).range(1..))
                        .default_value("1000"),
                ),
        )
        .subcommand(Command::new("check-config").about("Validate and print the endpoint settings"))
}
