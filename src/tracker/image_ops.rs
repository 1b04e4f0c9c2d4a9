//! Change detection on grayscale frames, built on `imageproc`.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::{threshold as binarize, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometry::contour_area;
use imageproc::map::map_colors2;
use imageproc::morphology;
use imageproc::rect::Rect;

use super::motion_box::MotionBox;

/// Pixels brighter than this in the difference image count as change.
const CHANGE_THRESHOLD: u8 = 2;
/// Three passes of a 3x3 square kernel.
const DILATE_RADIUS: u8 = 3;

/// Gaussian kernel size for a blur strength setting (odd, 7..=15).
pub fn kernel_size(blur_strength: f32) -> u32 {
    (5.0 + blur_strength * 2.0) as u32
}

/// Sigma a Gaussian of the given kernel size gets when none is specified.
pub fn kernel_sigma(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

pub fn gaussian_blur(image: &GrayImage, blur_strength: f32) -> GrayImage {
    gaussian_blur_f32(image, kernel_sigma(kernel_size(blur_strength)))
}

/// Both images must have the same dimensions.
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    map_colors2(a, b, |pa: Luma<u8>, pb: Luma<u8>| Luma([pa[0].abs_diff(pb[0])]))
}

pub fn threshold(image: &GrayImage) -> GrayImage {
    binarize(image, CHANGE_THRESHOLD, ThresholdType::Binary)
}

pub fn dilate(mask: &GrayImage) -> GrayImage {
    morphology::dilate(mask, Norm::LInf, DILATE_RADIUS)
}

/// Bounding boxes of the outermost foreground contours of a binary mask.
///
/// Boxes come out in scan order (top-most region first). The area is the
/// area enclosed by the contour, rounded to whole pixels.
pub fn find_boxes(mask: &GrayImage) -> Vec<MotionBox> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter_map(|contour| {
            let xs = contour.points.iter().map(|p| p.x);
            let ys = contour.points.iter().map(|p| p.y);
            let (min_x, max_x) = (xs.clone().min()?, xs.max()?);
            let (min_y, max_y) = (ys.clone().min()?, ys.max()?);
            let area = contour_area(&contour.points).abs().round() as u32;
            Some(MotionBox::new(
                min_x,
                min_y,
                max_x - min_x + 1,
                max_y - min_y + 1,
                area,
            ))
        })
        .collect()
}

/// Draws a 2px black frame around a box, padded outward, clipped to the image.
pub fn outline_box(image: &mut GrayImage, b: &MotionBox) {
    let left = b.x - 2;
    let top = b.y - 2;
    let width = (b.w + 7) as u32;
    let height = (b.h + 7) as u32;
    let black = Luma([0]);
    draw_hollow_rect_mut(image, Rect::at(left, top).of_size(width, height), black);
    draw_hollow_rect_mut(
        image,
        Rect::at(left + 1, top + 1).of_size(width - 2, height - 2),
        black,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([0]))
    }

    fn fill(image: &mut GrayImage, x: u32, y: u32, w: u32, h: u32, value: u8) {
        for yy in y..y + h {
            for xx in x..x + w {
                image.put_pixel(xx, yy, Luma([value]));
            }
        }
    }

    #[test]
    fn kernel_follows_blur_strength() {
        assert_eq!(kernel_size(1.0), 7);
        assert_eq!(kernel_size(4.0), 13);
        assert_eq!(kernel_size(5.0), 15);
        assert!((kernel_sigma(7) - 1.4).abs() < 1e-6);
    }

    #[test]
    fn difference_and_threshold_mark_changed_pixels() {
        let a = blank(8, 8);
        let mut b = blank(8, 8);
        b.put_pixel(1, 1, Luma([2]));
        b.put_pixel(2, 2, Luma([3]));

        let mask = threshold(&abs_diff(&a, &b));
        assert_eq!(mask.get_pixel(1, 1)[0], 0);
        assert_eq!(mask.get_pixel(2, 2)[0], 255);
    }

    #[test]
    fn dilation_grows_three_pixels_each_way() {
        let mut mask = blank(20, 20);
        mask.put_pixel(10, 10, Luma([255]));
        let grown = dilate(&mask);
        let boxes = find_boxes(&grown);
        assert_eq!(boxes.len(), 1);
        assert_eq!((boxes[0].x, boxes[0].y, boxes[0].w, boxes[0].h), (7, 7, 7, 7));
        // Enclosed by the border pixel centers, as a contour area is.
        assert_eq!(boxes[0].area, 36);
    }

    #[test]
    fn separate_regions_get_separate_boxes() {
        let mut mask = blank(40, 20);
        fill(&mut mask, 2, 2, 5, 4, 255);
        fill(&mut mask, 20, 10, 10, 3, 255);
        let boxes = find_boxes(&mask);
        assert_eq!(boxes.len(), 2);
        assert_eq!((boxes[0].x, boxes[0].y, boxes[0].w, boxes[0].h), (2, 2, 5, 4));
        assert_eq!((boxes[1].x, boxes[1].y, boxes[1].w, boxes[1].h), (20, 10, 10, 3));
        assert_eq!(boxes[1].area, 18);
    }

    #[test]
    fn holes_do_not_produce_boxes() {
        let mut mask = blank(30, 30);
        fill(&mut mask, 5, 5, 20, 20, 255);
        fill(&mut mask, 10, 10, 10, 10, 0);
        fill(&mut mask, 13, 13, 4, 4, 255);
        let boxes = find_boxes(&mask);
        assert_eq!(boxes.len(), 1);
        assert_eq!((boxes[0].x, boxes[0].y, boxes[0].w, boxes[0].h), (5, 5, 20, 20));
    }

    #[test]
    fn outline_is_clipped_at_the_border() {
        let mut image = GrayImage::from_pixel(10, 10, Luma([255]));
        outline_box(&mut image, &MotionBox::new(0, 0, 3, 3, 9));
        assert_eq!(image.get_pixel(0, 6)[0], 0);
        assert_eq!(image.get_pixel(0, 0)[0], 255);
        assert_eq!(image.get_pixel(3, 3)[0], 255);
        assert_eq!(image.get_pixel(7, 2)[0], 0);
    }
}
