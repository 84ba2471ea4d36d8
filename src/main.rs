fn main() -> anyhow::Result<()> {
    servo_power::init_common();
    let matches = servo_power::cli::parse_args();
    servo_power::start(&matches)
}
