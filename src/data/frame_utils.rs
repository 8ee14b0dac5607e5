//! Readers and writers for image frames and ground-truth flow files.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use image::{ImageBuffer, Rgb};
use ndarray::{Array2, Array3};

use crate::constants::data;
use crate::error::{FlowError, Result};

/// Reads an 8-bit image as `[3, H, W]` floats in 0..=255.
///
/// Grayscale input is tiled to three channels and alpha is dropped.
pub fn read_image(path: impl AsRef<Path>) -> Result<Array3<f32>> {
	let rgb = image::open(path.as_ref())?.to_rgb8();
	let (w, h) = rgb.dimensions();
	Ok(Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
		rgb.get_pixel(x as u32, y as u32)[c] as f32
	}))
}

pub fn write_image(path: impl AsRef<Path>, img: &Array3<f32>) -> Result<()> {
	let (c, h, w) = img.dim();
	if c != 3 {
		return Err(FlowError::shape_mismatch((3, h, w), img.dim()));
	}
	let buffer = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
		let px = |ch: usize| img[[ch, y as usize, x as usize]].round().clamp(0.0, 255.0) as u8;
		Rgb([px(0), px(1), px(2)])
	});
	buffer.save(path.as_ref())?;
	Ok(())
}

/// Reads a Middlebury `.flo` file as `[2, H, W]`.
pub fn read_flo(path: impl AsRef<Path>) -> Result<Array3<f32>> {
	let path = path.as_ref();
	let mut reader = BufReader::new(File::open(path)?);
	let magic = reader.read_f32::<LittleEndian>()?;
	if magic != data::FLO_MAGIC {
		return Err(FlowError::invalid_data(path, format!("bad .flo magic number {}", magic)));
	}
	let w = reader.read_i32::<LittleEndian>()?;
	let h = reader.read_i32::<LittleEndian>()?;
	if w <= 0 || h <= 0 {
		return Err(FlowError::invalid_data(path, format!("bad .flo size {}x{}", w, h)));
	}
	let (w, h) = (w as usize, h as usize);
	let mut values = vec![0f32; 2 * w * h];
	reader.read_f32_into::<LittleEndian>(&mut values)?;

	// stored row-major with u and v interleaved
	Ok(Array3::from_shape_fn((2, h, w), |(c, y, x)| values[(y * w + x) * 2 + c]))
}

pub fn write_flo(path: impl AsRef<Path>, flow: &Array3<f32>) -> Result<()> {
	let (c, h, w) = flow.dim();
	if c != 2 {
		return Err(FlowError::shape_mismatch((2, h, w), flow.dim()));
	}
	let mut writer = BufWriter::new(File::create(path.as_ref())?);
	writer.write_f32::<LittleEndian>(data::FLO_MAGIC)?;
	writer.write_i32::<LittleEndian>(w as i32)?;
	writer.write_i32::<LittleEndian>(h as i32)?;
	for y in 0..h {
		for x in 0..w {
			writer.write_f32::<LittleEndian>(flow[[0, y, x]])?;
			writer.write_f32::<LittleEndian>(flow[[1, y, x]])?;
		}
	}
	writer.flush()?;
	Ok(())
}

/// Reads the first two channels of a `.pfm` file as flow.
pub fn read_pfm(path: impl AsRef<Path>) -> Result<Array3<f32>> {
	let path = path.as_ref();
	let bytes = fs::read(path)?;

	let mut fields = Vec::with_capacity(4);
	let mut pos = 0;
	while fields.len() < 4 {
		while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
			pos += 1;
		}
		let start = pos;
		while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
			pos += 1;
		}
		if start == pos {
			return Err(FlowError::invalid_data(path, "truncated PFM header"));
		}
		fields.push(String::from_utf8_lossy(&bytes[start..pos]).into_owned());
	}
	// exactly one whitespace byte separates the header from the data
	pos += 1;

	let channels = match fields[0].as_str() {
		"PF" => 3,
		"Pf" => 1,
		other => return Err(FlowError::invalid_data(path, format!("not a PFM file (header '{}')", other))),
	};
	let parse = |s: &str| {
		s.parse::<usize>()
			.map_err(|_| FlowError::invalid_data(path, format!("bad PFM dimension '{}'", s)))
	};
	let (w, h) = (parse(&fields[1])?, parse(&fields[2])?);
	let scale: f32 = fields[3]
		.parse()
		.map_err(|_| FlowError::invalid_data(path, format!("bad PFM scale '{}'", fields[3])))?;
	if channels < 2 {
		return Err(FlowError::invalid_data(path, "PFM flow needs at least two channels"));
	}

	let count = w * h * channels;
	let body = bytes
		.get(pos..pos + count * 4)
		.ok_or_else(|| FlowError::invalid_data(path, "truncated PFM data"))?;
	let mut values = vec![0f32; count];
	if scale < 0.0 {
		LittleEndian::read_f32_into(body, &mut values);
	} else {
		BigEndian::read_f32_into(body, &mut values);
	}

	// rows are stored bottom to top
	Ok(Array3::from_shape_fn((2, h, w), |(c, y, x)| {
		values[((h - 1 - y) * w + x) * channels + c]
	}))
}

pub fn write_pfm(path: impl AsRef<Path>, flow: &Array3<f32>) -> Result<()> {
	let (c, h, w) = flow.dim();
	if c != 2 {
		return Err(FlowError::shape_mismatch((2, h, w), flow.dim()));
	}
	let mut writer = BufWriter::new(File::create(path.as_ref())?);
	write!(writer, "PF\n{} {}\n-1.0\n", w, h)?;
	for y in (0..h).rev() {
		for x in 0..w {
			writer.write_f32::<LittleEndian>(flow[[0, y, x]])?;
			writer.write_f32::<LittleEndian>(flow[[1, y, x]])?;
			writer.write_f32::<LittleEndian>(0.0)?;
		}
	}
	writer.flush()?;
	Ok(())
}

/// Reads a KITTI 16-bit flow PNG into flow and its valid mask.
pub fn read_flow_kitti(path: impl AsRef<Path>) -> Result<(Array3<f32>, Array2<f32>)> {
	let rgb = image::open(path.as_ref())?.to_rgb16();
	let (w, h) = rgb.dimensions();
	let (w, h) = (w as usize, h as usize);
	let decode = |v: u16| (v as f32 - data::KITTI_FLOW_OFFSET) / data::KITTI_FLOW_SCALE;
	let flow = Array3::from_shape_fn((2, h, w), |(c, y, x)| decode(rgb.get_pixel(x as u32, y as u32)[c]));
	let valid = Array2::from_shape_fn((h, w), |(y, x)| {
		if rgb.get_pixel(x as u32, y as u32)[2] > 0 {
			1.0
		} else {
			0.0
		}
	});
	Ok((flow, valid))
}

pub fn write_flow_kitti(path: impl AsRef<Path>, flow: &Array3<f32>, valid: &Array2<f32>) -> Result<()> {
	let (c, h, w) = flow.dim();
	if c != 2 || valid.dim() != (h, w) {
		return Err(FlowError::shape_mismatch(((2, h, w), (h, w)), (flow.dim(), valid.dim())));
	}
	let encode = |v: f32| (v * data::KITTI_FLOW_SCALE + data::KITTI_FLOW_OFFSET).round().clamp(0.0, 65535.0) as u16;
	let buffer: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
		let (x, y) = (x as usize, y as usize);
		let ok = if valid[[y, x]] >= 0.5 { 1 } else { 0 };
		Rgb([encode(flow[[0, y, x]]), encode(flow[[1, y, x]]), ok])
	});
	buffer.save(path.as_ref())?;
	Ok(())
}

/// Reads any supported flow file; the mask is present only for sparse formats.
pub fn read_flow(path: impl AsRef<Path>) -> Result<(Array3<f32>, Option<Array2<f32>>)> {
	let path = path.as_ref();
	let ext = path
		.extension()
		.and_then(|e| e.to_str())
		.map(|e| e.to_ascii_lowercase())
		.unwrap_or_default();
	match ext.as_str() {
		"flo" => Ok((read_flo(path)?, None)),
		"pfm" => Ok((read_pfm(path)?, None)),
		"png" => read_flow_kitti(path).map(|(flow, valid)| (flow, Some(valid))),
		_ => Err(FlowError::invalid_data(path, "unsupported flow file extension")),
	}
}

/// Dense ground truth is valid where both components stay below the sentinel.
pub fn dense_valid_mask(flow: &Array3<f32>) -> Array2<f32> {
	let (_, h, w) = flow.dim();
	Array2::from_shape_fn((h, w), |(y, x)| {
		let (u, v) = (flow[[0, y, x]], flow[[1, y, x]]);
		if u.abs() < data::DENSE_FLOW_LIMIT && v.abs() < data::DENSE_FLOW_LIMIT {
			1.0
		} else {
			0.0
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn flow() -> Array3<f32> {
		Array3::from_shape_fn((2, 3, 4), |(c, y, x)| c as f32 * 10.0 + y as f32 - x as f32 * 0.5)
	}

	#[test]
	fn flo_files_keep_layout() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.flo");
		write_flo(&path, &flow()).unwrap();
		assert_eq!(read_flo(&path).unwrap(), flow());

		fs::write(&path, [0u8; 12]).unwrap();
		assert!(matches!(read_flo(&path), Err(FlowError::InvalidData { .. })));
	}

	#[test]
	fn pfm_rows_are_flipped_back() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.pfm");
		write_pfm(&path, &flow()).unwrap();
		let (read, valid) = read_flow(&path).unwrap();
		assert_eq!(read, flow());
		assert!(valid.is_none());
	}

	#[test]
	fn kitti_png_carries_valid_mask() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.png");
		let mut valid = Array2::ones((3, 4));
		valid[[1, 2]] = 0.0;
		write_flow_kitti(&path, &flow(), &valid).unwrap();
		let (read, mask) = read_flow(&path).unwrap();
		assert_eq!(mask.unwrap(), valid);
		assert!((read[[1, 2, 3]] - flow()[[1, 2, 3]]).abs() < 1.0 / 64.0);
	}

	#[test]
	fn dense_mask_drops_sentinel_values() {
		let mut f = flow();
		f[[0, 0, 0]] = 1e9;
		let mask = dense_valid_mask(&f);
		assert_eq!(mask[[0, 0]], 0.0);
		assert_eq!(mask.sum(), 11.0);
	}

	#[test]
	fn images_round_trip_through_png() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("img.png");
		let img = Array3::from_shape_fn((3, 2, 5), |(c, y, x)| (c * 40 + y * 20 + x) as f32);
		write_image(&path, &img).unwrap();
		assert_eq!(read_image(&path).unwrap(), img);
	}
}
