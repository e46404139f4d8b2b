/// A labelled grayscale image, pixels stored row by row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digit {
    label: u8,
    pixels: Vec<u8>,
}

impl Digit {
    pub fn new(label: u8, pixels: Vec<u8>) -> Self {
        Self { label, pixels }
    }

    pub fn label(&self) -> u8 {
        self.label
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Get pixel value at (row, col) given a specific width
    pub fn pixel_at(&self, row: usize, col: usize, width: usize) -> u8 {
        self.pixels[row * width + col]
    }

    /// Pixels scaled to `[0, 1]`
    pub fn normalized_pixels(&self) -> impl Iterator<Item = f32> + '_ {
        self.pixels.iter().map(|&p| f32::from(p) / 255.0)
    }

    /// Render as shaded block characters, one line per row
    pub fn to_ascii_art(&self, width: usize, height: usize) -> String {
        const CHARS: [char; 5] = [' ', '░', '▒', '▓', '█'];

        let mut result = String::with_capacity((width + 1) * height);
        for row in 0..height {
            for col in 0..width {
                let pixel = self.pixel_at(row, col, width);
                let char_idx = (pixel as usize * (CHARS.len() - 1)) / 255;
                result.push(CHARS[char_idx]);
            }
            result.push('\n');
        }
        result
    }
}
