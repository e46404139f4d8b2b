use std::error::Error;
use std::fs::File;
use std::io::BufReader;

use common::{parse_idx_images, parse_idx_labels, Digit};

use crate::commands::DataArgs;

pub fn print_numbers(data: &DataArgs, n: usize) -> Result<(), Box<dyn Error>> {
    let images = parse_idx_images(BufReader::new(File::open(&data.images)?))?;
    let labels = parse_idx_labels(BufReader::new(File::open(&data.labels)?))?;

    for (i, &label) in labels.iter().take(n.min(images.len())).enumerate() {
        let digit = Digit::new(label, images.image(i).to_vec());
        println!("=== Digit {} (sample {}) ===", digit.label(), i + 1);
        print!("{}", digit.to_ascii_art(images.columns, images.rows));
        println!();
    }

    Ok(())
}
