use crate::error::{Error, Result};
use crate::mnist::IMAGE_SIDE;
use ndarray::{Array2, ArrayView1};
use ndarray_rand::rand::{Rng, seq::index};
use plotly::{
    HeatMap, Layout, Plot, Scatter,
    common::{ColorScale, ColorScalePalette, Mode, Title},
    layout::Axis,
};
use std::{fs, path::Path};
use tracing::info;

// Blank columns between neighbouring digits in the sample grid.
const GAP: usize = 2;

// One test image picked for display with what it really is and what the network said.
pub struct Sample<'a> {
    pub pixels: ArrayView1<'a, f64>,
    pub label: u8,
    pub predicted: usize,
}

impl Sample<'_> {
    pub fn caption(&self) -> String {
        format!("True: {}, Pred: {}", self.label, self.predicted)
    }
}

// Picks `count` distinct indices out of 0..len, or all of them if there are fewer.
pub fn choose_samples<R: Rng + ?Sized>(len: usize, count: usize, rng: &mut R) -> Vec<usize> {
    index::sample(rng, len, count.min(len)).into_vec()
}

// Writes the per-epoch losses as a line chart.
pub fn loss_curve(losses: &[f64], path: &Path) -> Result<()> {
    let epochs = (0..losses.len()).collect::<Vec<_>>();
    let trace = Scatter::new(epochs, losses.to_vec())
        .mode(Mode::Lines)
        .name("loss");

    let mut plot = Plot::new();
    plot.add_trace(trace);
    plot.set_layout(
        Layout::new()
            .title(Title::new("Training Loss"))
            .x_axis(Axis::new().title(Title::new("Epoch")))
            .y_axis(Axis::new().title(Title::new("Loss"))),
    );

    write_plot(&plot, path)
}

// Writes the samples side by side as one grayscale heatmap, captioned in the title.
pub fn sample_grid(samples: &[Sample], path: &Path) -> Result<()> {
    if samples.is_empty() {
        return Err(Error::EmptyInput("no samples to plot"));
    }

    let width = samples.len() * (IMAGE_SIDE + GAP) - GAP;
    let mut canvas = Array2::<f64>::zeros((IMAGE_SIDE, width));
    for (position, sample) in samples.iter().enumerate() {
        let image = display_image(&sample.pixels)?;
        let left = position * (IMAGE_SIDE + GAP);
        canvas
            .slice_mut(ndarray::s![.., left..left + IMAGE_SIDE])
            .assign(&image);
    }

    // Heatmap rows are drawn bottom up.
    let z = canvas
        .rows()
        .into_iter()
        .rev()
        .map(|row| row.to_vec())
        .collect::<Vec<_>>();
    let captions = samples.iter().map(Sample::caption).collect::<Vec<_>>();

    let mut plot = Plot::new();
    plot.add_trace(HeatMap::new_z(z).color_scale(ColorScale::Palette(ColorScalePalette::Greys)));
    plot.set_layout(Layout::new().title(Title::new(&captions.join("  |  "))));

    write_plot(&plot, path)
}

fn write_plot(plot: &Plot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, plot.to_html()).map_err(|e| Error::Plot(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "wrote plot");
    Ok(())
}

// Reshapes a flattened image to 28 x 28 and stretches it to [0, 1]. Standardized pixels are not
// bounded, so the image's own range is used.
fn display_image(pixels: &ArrayView1<f64>) -> Result<Array2<f64>> {
    let image = pixels
        .to_owned()
        .into_shape_with_order((IMAGE_SIDE, IMAGE_SIDE))
        .map_err(|_| Error::shape("sample image", IMAGE_SIDE * IMAGE_SIDE, pixels.len()))?;

    let low = image.fold(f64::INFINITY, |low, &v| low.min(v));
    let high = image.fold(f64::NEG_INFINITY, |high, &v| high.max(v));
    let range = high - low;
    if range > 0.0 {
        Ok(image.mapv(|v| (v - low) / range))
    } else {
        Ok(Array2::zeros((IMAGE_SIDE, IMAGE_SIDE)))
    }
}

// Draws an image with block shading characters, one text row per pixel row.
pub fn render_ascii(pixels: &ArrayView1<f64>) -> Result<String> {
    let image = display_image(pixels)?;
    let mut out = String::with_capacity(IMAGE_SIDE * (IMAGE_SIDE + 1) * 3);

    for row in image.rows() {
        for &intensity in row {
            out.push(match intensity {
                a if a < 0.2 => ' ',
                a if a < 0.4 => '░',
                a if a < 0.6 => '▒',
                a if a < 0.8 => '▓',
                _ => '█',
            });
        }
        out.push('\n');
    }

    Ok(out)
}

pub fn print_samples(samples: &[Sample]) -> Result<()> {
    for sample in samples {
        println!("{}", render_ascii(&sample.pixels)?);
        println!("{}\n", sample.caption());
    }
    Ok(())
}
