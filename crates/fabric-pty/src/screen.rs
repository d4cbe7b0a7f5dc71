//! Plain-text screen model used for processed captures.
//!
//! Only the parts of VT100/xterm that move text around are interpreted: printing,
//! cursor motion, erases, scrolling and the alternate screen. Colors and other
//! attributes are dropped since captures are plain text.

use std::collections::VecDeque;

use vte::{Params, Parser, Perform};

/// Lines kept above the viewport.
pub const MAX_HISTORY_LINES: usize = 5_000;

const TAB_WIDTH: usize = 8;

pub struct Screen {
    parser: Parser,
    grid: Grid,
}

impl Screen {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            parser: Parser::new(),
            grid: Grid::new(rows, cols),
        }
    }

    /// Feed raw PTY output. Parser state carries over between calls.
    pub fn process(&mut self, data: &[u8]) {
        for byte in data {
            self.parser.advance(&mut self.grid, *byte);
        }
    }

    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.grid.resize(rows, cols);
    }

    /// Visible rows, trailing spaces trimmed.
    pub fn viewport_lines(&self) -> Vec<String> {
        self.grid.cells.iter().map(|row| render(row)).collect()
    }

    /// History followed by the viewport, without trailing blank lines.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.grid.history.iter().cloned().collect();
        lines.extend(self.viewport_lines());
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.grid.cursor_row, self.grid.cursor_col)
    }
}

fn render(row: &[char]) -> String {
    let line: String = row.iter().collect();
    line.trim_end().to_string()
}

struct SavedScreen {
    cells: Vec<Vec<char>>,
    cursor: (usize, usize),
}

struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<Vec<char>>,
    history: VecDeque<String>,
    cursor_row: usize,
    cursor_col: usize,
    pending_wrap: bool,
    /// Inclusive top and bottom rows of the scrolling region.
    scroll_region: (usize, usize),
    saved_cursor: Option<(usize, usize)>,
    primary: Option<SavedScreen>,
}

impl Grid {
    fn new(rows: usize, cols: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        Self {
            rows,
            cols,
            cells: vec![vec![' '; cols]; rows],
            history: VecDeque::new(),
            cursor_row: 0,
            cursor_col: 0,
            pending_wrap: false,
            scroll_region: (0, rows - 1),
            saved_cursor: None,
            primary: None,
        }
    }

    fn blank_row(&self) -> Vec<char> {
        vec![' '; self.cols]
    }

    fn resize(&mut self, rows: usize, cols: usize) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        for row in &mut self.cells {
            row.resize(cols, ' ');
        }
        self.cols = cols;

        // Shrinking pushes rows above the cursor into history first, then drops from the bottom.
        while self.cells.len() > rows {
            if self.cursor_row > 0 {
                let top = self.cells.remove(0);
                self.push_history(&top);
                self.cursor_row -= 1;
            } else {
                self.cells.pop();
            }
        }
        while self.cells.len() < rows {
            self.cells.push(vec![' '; cols]);
        }
        self.rows = rows;
        self.scroll_region = (0, rows - 1);
        self.cursor_row = self.cursor_row.min(rows - 1);
        self.cursor_col = self.cursor_col.min(cols - 1);
        self.pending_wrap = false;
        self.primary = None;
    }

    fn push_history(&mut self, row: &[char]) {
        if self.primary.is_some() {
            return;
        }
        self.history.push_back(render(row));
        while self.history.len() > MAX_HISTORY_LINES {
            self.history.pop_front();
        }
    }

    fn scroll_up(&mut self, n: usize) {
        let (top, bottom) = self.scroll_region;
        for _ in 0..n {
            let row = self.cells.remove(top);
            if top == 0 {
                self.push_history(&row);
            }
            let blank = self.blank_row();
            self.cells.insert(bottom, blank);
        }
    }

    fn scroll_down(&mut self, n: usize) {
        let (top, bottom) = self.scroll_region;
        for _ in 0..n {
            self.cells.remove(bottom);
            let blank = self.blank_row();
            self.cells.insert(top, blank);
        }
    }

    fn linefeed(&mut self) {
        let (_, bottom) = self.scroll_region;
        if self.cursor_row == bottom {
            self.scroll_up(1);
        } else if self.cursor_row + 1 < self.rows {
            self.cursor_row += 1;
        }
    }

    fn reverse_index(&mut self) {
        let (top, _) = self.scroll_region;
        if self.cursor_row == top {
            self.scroll_down(1);
        } else {
            self.cursor_row = self.cursor_row.saturating_sub(1);
        }
    }

    fn put_char(&mut self, c: char) {
        if self.pending_wrap {
            self.pending_wrap = false;
            self.cursor_col = 0;
            self.linefeed();
        }
        self.cells[self.cursor_row][self.cursor_col] = c;
        if self.cursor_col + 1 >= self.cols {
            self.pending_wrap = true;
        } else {
            self.cursor_col += 1;
        }
    }

    fn erase_in_display(&mut self, mode: u16) {
        match mode {
            0 => {
                self.erase_in_line(0);
                for row in self.cursor_row + 1..self.rows {
                    self.cells[row].fill(' ');
                }
            }
            1 => {
                self.erase_in_line(1);
                for row in 0..self.cursor_row {
                    self.cells[row].fill(' ');
                }
            }
            2 => {
                for row in &mut self.cells {
                    row.fill(' ');
                }
            }
            3 => self.history.clear(),
            _ => {}
        }
    }

    fn erase_in_line(&mut self, mode: u16) {
        let col = self.cursor_col;
        let row = &mut self.cells[self.cursor_row];
        match mode {
            0 => row[col..].fill(' '),
            1 => row[..=col].fill(' '),
            2 => row.fill(' '),
            _ => {}
        }
    }

    fn set_alternate_screen(&mut self, enabled: bool) {
        if enabled && self.primary.is_none() {
            let blank = vec![vec![' '; self.cols]; self.rows];
            let cells = std::mem::replace(&mut self.cells, blank);
            self.primary = Some(SavedScreen {
                cells,
                cursor: (self.cursor_row, self.cursor_col),
            });
        } else if !enabled {
            if let Some(saved) = self.primary.take() {
                self.cells = saved.cells;
                (self.cursor_row, self.cursor_col) = saved.cursor;
            }
        }
        self.pending_wrap = false;
    }
}

fn param(values: &[u16], i: usize, default: u16) -> u16 {
    match values.get(i).copied() {
        Some(0) | None => default,
        Some(v) => v,
    }
}

impl Perform for Grid {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            // Backspace
            0x08 => {
                if self.pending_wrap {
                    self.pending_wrap = false;
                } else {
                    self.cursor_col = self.cursor_col.saturating_sub(1);
                }
            }
            // Tab
            0x09 => {
                let next = (self.cursor_col / TAB_WIDTH + 1) * TAB_WIDTH;
                self.cursor_col = next.min(self.cols - 1);
            }
            // Line feed, vertical tab, form feed
            0x0A..=0x0C => {
                self.pending_wrap = false;
                self.linefeed();
            }
            0x0D => {
                self.cursor_col = 0;
                self.pending_wrap = false;
            }
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let values: Vec<u16> = params.iter().map(|p| p[0]).collect();
        let n = param(&values, 0, 1) as usize;
        self.pending_wrap = false;

        if intermediates == [b'?'] {
            if matches!(action, 'h' | 'l') {
                for mode in &values {
                    if matches!(mode, 47 | 1047 | 1049) {
                        self.set_alternate_screen(action == 'h');
                    }
                }
            }
            return;
        }
        if !intermediates.is_empty() {
            return;
        }

        match action {
            'A' => self.cursor_row = self.cursor_row.saturating_sub(n),
            'B' => self.cursor_row = (self.cursor_row + n).min(self.rows - 1),
            'C' => self.cursor_col = (self.cursor_col + n).min(self.cols - 1),
            'D' => self.cursor_col = self.cursor_col.saturating_sub(n),
            'E' => {
                self.cursor_row = (self.cursor_row + n).min(self.rows - 1);
                self.cursor_col = 0;
            }
            'F' => {
                self.cursor_row = self.cursor_row.saturating_sub(n);
                self.cursor_col = 0;
            }
            'G' | '`' => self.cursor_col = (n - 1).min(self.cols - 1),
            'd' => self.cursor_row = (n - 1).min(self.rows - 1),
            'H' | 'f' => {
                let col = param(&values, 1, 1) as usize;
                self.cursor_row = (n - 1).min(self.rows - 1);
                self.cursor_col = (col - 1).min(self.cols - 1);
            }
            'J' => self.erase_in_display(values.first().copied().unwrap_or(0)),
            'K' => self.erase_in_line(values.first().copied().unwrap_or(0)),
            'X' => {
                let end = (self.cursor_col + n).min(self.cols);
                self.cells[self.cursor_row][self.cursor_col..end].fill(' ');
            }
            'P' => {
                let row = &mut self.cells[self.cursor_row];
                let n = n.min(self.cols - self.cursor_col);
                row.drain(self.cursor_col..self.cursor_col + n);
                row.resize(self.cols, ' ');
            }
            '@' => {
                let row = &mut self.cells[self.cursor_row];
                let n = n.min(self.cols - self.cursor_col);
                for _ in 0..n {
                    row.insert(self.cursor_col, ' ');
                }
                row.truncate(self.cols);
            }
            'L' | 'M' => {
                let (top, bottom) = self.scroll_region;
                if self.cursor_row < top || self.cursor_row > bottom {
                    return;
                }
                let saved = self.scroll_region;
                self.scroll_region = (self.cursor_row, bottom);
                if action == 'L' {
                    self.scroll_down(n.min(bottom - self.cursor_row + 1));
                } else {
                    for _ in 0..n.min(bottom - self.cursor_row + 1) {
                        self.cells.remove(self.cursor_row);
                        let blank = self.blank_row();
                        self.cells.insert(bottom, blank);
                    }
                }
                self.scroll_region = saved;
            }
            'S' => self.scroll_up(n),
            'T' => self.scroll_down(n),
            'r' => {
                let top = param(&values, 0, 1) as usize - 1;
                let bottom = param(&values, 1, self.rows as u16) as usize - 1;
                if top < bottom && bottom < self.rows {
                    self.scroll_region = (top, bottom);
                    self.cursor_row = 0;
                    self.cursor_col = 0;
                }
            }
            's' => self.saved_cursor = Some((self.cursor_row, self.cursor_col)),
            'u' => {
                if let Some((row, col)) = self.saved_cursor {
                    self.cursor_row = row.min(self.rows - 1);
                    self.cursor_col = col.min(self.cols - 1);
                }
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        if !intermediates.is_empty() {
            return;
        }
        match byte {
            b'7' => self.saved_cursor = Some((self.cursor_row, self.cursor_col)),
            b'8' => {
                if let Some((row, col)) = self.saved_cursor {
                    self.cursor_row = row.min(self.rows - 1);
                    self.cursor_col = col.min(self.cols - 1);
                }
            }
            b'D' => self.linefeed(),
            b'E' => {
                self.linefeed();
                self.cursor_col = 0;
            }
            b'M' => self.reverse_index(),
            b'c' => {
                let history = std::mem::take(&mut self.history);
                *self = Grid::new(self.rows, self.cols);
                self.history = history;
            }
            _ => {}
        }
    }
}
