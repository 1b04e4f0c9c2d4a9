use std::collections::BTreeMap;

/// Bounding box of one changed region, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub area: u32,
}

impl MotionBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32, area: u32) -> Self {
        Self { x, y, w, h, area }
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn center_x(&self) -> f32 {
        self.x as f32 + self.w as f32 / 2.0
    }

    /// Same rectangle. Area is ignored.
    pub fn same_rect(&self, other: &MotionBox) -> bool {
        self.x == other.x && self.y == other.y && self.w == other.w && self.h == other.h
    }

    /// Axis-aligned overlap; touching edges count.
    pub fn overlaps(&self, other: &MotionBox) -> bool {
        !(self.right() < other.x
            || self.x > other.right()
            || self.y + self.h < other.y
            || self.y > other.y + other.h)
    }

    pub fn straddles(&self, column: i32) -> bool {
        self.x < column && self.right() > column
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }
}

/// Motion boxes per frame position, keeping only the most recent window.
#[derive(Debug, Default)]
pub struct MotionHistory {
    boxes: BTreeMap<u32, Vec<MotionBox>>,
    window: u32,
}

impl MotionHistory {
    pub fn new(window: u32) -> Self {
        Self {
            boxes: BTreeMap::new(),
            window,
        }
    }

    pub fn insert(&mut self, position: u32, boxes: Vec<MotionBox>) {
        self.boxes.insert(position, boxes);
        let oldest = position.saturating_sub(self.window);
        while let Some((&first, _)) = self.boxes.first_key_value() {
            if first > oldest {
                break;
            }
            self.boxes.remove(&first);
        }
    }

    pub fn get(&self, position: u32) -> Option<&[MotionBox]> {
        self.boxes.get(&position).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn clear(&mut self) {
        self.boxes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_includes_touching_edges() {
        let a = MotionBox::new(10, 10, 10, 10, 100);
        assert!(a.overlaps(&MotionBox::new(20, 10, 5, 5, 25)));
        assert!(a.overlaps(&MotionBox::new(15, 15, 2, 2, 4)));
        assert!(!a.overlaps(&MotionBox::new(21, 10, 5, 5, 25)));
        assert!(!a.overlaps(&MotionBox::new(10, 0, 5, 5, 25)));
    }

    #[test]
    fn history_forgets_positions_outside_the_window() {
        let mut history = MotionHistory::new(4);
        for position in 1..=10 {
            history.insert(position, vec![MotionBox::default()]);
        }
        assert_eq!(history.len(), 4);
        assert!(history.get(6).is_none());
        assert!(history.get(7).is_some());
        assert!(history.get(10).is_some());
    }
}
