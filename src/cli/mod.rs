pub mod actions;
pub mod config;
pub mod console;

use clap::{Arg, ArgAction, ArgMatches, Command};

/// Build the command line definition.
pub fn build_command() -> Command {
    Command::new("servo-power")
        .about("Measure DUT power through a servo while running workload scripts")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("list-ports")
                .about("List serial ports, servo and DUT consoles first")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .short('j')
                        .help("Output the port list in JSON format")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run every workload script for every iteration and compare power")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .help("Measurement configuration file (JSON)")
                        .value_name("FILE")
                        .required(true),
                )
                .arg(
                    Arg::new("script")
                        .long("script")
                        .short('s')
                        .help("Workload script file; repeat for several configurations. Replaces the scripts of the configuration file")
                        .value_name("FILE")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("export")
                        .long("export")
                        .short('o')
                        .help("Write the finished session to this file")
                        .value_name("FILE"),
                )
                .arg(
                    Arg::new("simulate")
                        .long("simulate")
                        .help("Use a simulated servo and DUT instead of serial ports")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("monitor")
                .about("Record servo power (and DUT markers) until Ctrl-C")
                .arg(
                    Arg::new("servo")
                        .long("servo")
                        .help("Servo serial port")
                        .value_name("PORT")
                        .required(true),
                )
                .arg(
                    Arg::new("dut")
                        .long("dut")
                        .help("DUT console serial port")
                        .value_name("PORT"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .help("Recording file (JSON)")
                        .value_name("FILE")
                        .required(true),
                )
                .arg(
                    Arg::new("baud-rate")
                        .long("baud-rate")
                        .help("Serial port baud rate")
                        .value_name("BAUD")
                        .default_value("115200")
                        .value_parser(clap::value_parser!(u32)),
                ),
        )
        .subcommand(
            Command::new("report")
                .about("Print statistics of a saved session")
                .arg(
                    Arg::new("session")
                        .help("Session file")
                        .value_name("FILE")
                        .required(true),
                )
                .arg(
                    Arg::new("iteration")
                        .long("iteration")
                        .short('i')
                        .help("Only this iteration (starting at 1)")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .short('j')
                        .help("Output statistics in JSON format")
                        .action(ArgAction::SetTrue),
                ),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}
