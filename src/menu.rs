use std::io::{self, Write};

pub fn show_menu() -> io::Result<()> {
    println!("\n===========================================");
    println!("WPT Testbed Console");
    println!("===========================================");
    println!("Select an option:");
    println!("1. Scan (steering)");
    println!("2. Scan (full sweep)");
    println!("3. Steer to Rx#");
    println!("4. Reset phases");
    println!("5. Set attenuation");
    println!("6. Set phase codes");
    println!("7. Show telemetry");
    println!("8. Start survey");
    println!("9. Exit");
    println!("===========================================");
    print!("Choice (1-9): ");
    io::stdout().flush()
}

pub fn get_user_choice() -> io::Result<Option<u32>> {
    Ok(read_line()?.trim().parse::<u32>().ok())
}

/// Prompts and reads one line. Returns `None` on an empty answer.
pub fn prompt(label: &str) -> io::Result<Option<String>> {
    print!("{label}: ");
    io::stdout().flush()?;
    let line = read_line()?;
    let line = line.trim();
    Ok((!line.is_empty()).then(|| line.to_string()))
}

pub fn wait_for_enter() -> io::Result<()> {
    println!("\nPress Enter to return to menu...");
    read_line().map(|_| ())
}

fn read_line() -> io::Result<String> {
    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
    }
    Ok(input)
}
