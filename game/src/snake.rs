//! Snake state, movement, and the delta encoding used on the wire.

use rand::Rng;
use shared::{Coord, Direction, SnakeState, SnakeWire};
use std::collections::VecDeque;

/// Result of advancing a snake by one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// The new head landed on the snake's own body.
    Died,
}

/// One snake on the field, owned by the containing [`crate::Field`].
///
/// The body is ordered head first; consecutive segments are toroidal
/// neighbors. Steering requests queue up in `next_directions` and are
/// validated only when the snake actually moves, so a burst of key presses
/// between two ticks cannot reverse the snake into itself.
#[derive(Debug, Clone)]
pub struct Snake {
    body: Vec<Coord>,
    head_direction: Direction,
    next_directions: VecDeque<Direction>,
    state: SnakeState,
    color: String,
    player_id: i32,
    score: i32,
    updated: bool,
}

impl Snake {
    /// Creates a snake from its initial segments (head first).
    pub fn new(body: Vec<Coord>, head_direction: Direction, player_id: i32) -> Self {
        let mut rng = rand::thread_rng();
        let color = format!(
            "#{:02x}{:02x}{:02x}",
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256)
        );
        Snake {
            body,
            head_direction,
            next_directions: VecDeque::new(),
            state: SnakeState::Alive,
            color,
            player_id,
            score: 0,
            updated: false,
        }
    }

    pub fn player_id(&self) -> i32 {
        self.player_id
    }

    pub fn head(&self) -> Coord {
        self.body[0]
    }

    pub fn body(&self) -> &[Coord] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn head_direction(&self) -> Direction {
        self.head_direction
    }

    pub fn state(&self) -> SnakeState {
        self.state
    }

    pub fn set_state(&mut self, state: SnakeState) {
        self.state = state;
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn add_score(&mut self, delta: i32) {
        self.score += delta;
    }

    pub fn set_score(&mut self, score: i32) {
        self.score = score;
    }

    /// Queues a steering request; validation happens at move time.
    pub fn enqueue_direction(&mut self, direction: Direction) {
        self.next_directions.push_back(direction);
    }

    /// Flag used during replica state ingestion to spot vanished snakes.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn set_updated(&mut self, updated: bool) {
        self.updated = updated;
    }

    /// Replaces the body and heading wholesale (replica ingestion path).
    pub fn overwrite(&mut self, body: Vec<Coord>, head_direction: Direction, state: SnakeState) {
        self.body = body;
        self.head_direction = head_direction;
        self.state = state;
    }

    pub fn body_contains(&self, cell: Coord) -> bool {
        self.body.contains(&cell)
    }

    /// Advances the head by one cell on a `width` x `height` torus.
    ///
    /// Drains the queued steering requests first: a request equal to the
    /// working direction or to its opposite is discarded, everything else
    /// becomes the new working direction. The survivor is committed as the
    /// head direction before the step, so a 180° turn can never happen even
    /// across several queued requests.
    pub fn advance(&mut self, width: i32, height: i32) -> MoveOutcome {
        let mut working = self.head_direction;
        while let Some(requested) = self.next_directions.pop_front() {
            if requested == working || requested == working.opposite() {
                continue;
            }
            working = requested;
        }
        self.head_direction = working;

        let (dx, dy) = working.offset();
        let head = self.head();
        let new_head = Coord::new(head.x + dx, head.y + dy).wrapped(width, height);

        if self.body_contains(new_head) {
            return MoveOutcome::Died;
        }

        self.body.insert(0, new_head);
        MoveOutcome::Moved
    }

    /// Drops the tail segment; a snake never shrinks below one cell.
    pub fn shrink(&mut self) {
        if self.body.len() > 1 {
            self.body.pop();
        }
    }

    /// Serializes the body into its wire form: absolute head plus run-length
    /// deltas, each run taking the short way around the torus.
    pub fn to_wire(&self, width: i32, height: i32) -> SnakeWire {
        let mut points = vec![self.head()];

        let mut run: Option<Coord> = None;
        for pair in self.body.windows(2) {
            let step = unit_delta(pair[0], pair[1], width, height);
            match run {
                Some(current) if same_axis(current, step) => {
                    run = Some(Coord::new(current.x + step.x, current.y + step.y));
                }
                Some(current) => {
                    points.push(current);
                    run = Some(step);
                }
                None => run = Some(step),
            }
        }
        if let Some(current) = run {
            points.push(current);
        }

        SnakeWire {
            player_id: self.player_id,
            points,
            state: self.state,
            head_direction: self.head_direction,
        }
    }

    /// Reconstructs a snake from its wire form by walking the deltas one
    /// unit step at a time, wrapping modulo the field size.
    pub fn from_wire(wire: &SnakeWire, width: i32, height: i32) -> Snake {
        let mut body = Vec::new();
        let mut cursor = wire.points[0];
        body.push(cursor);

        for delta in wire.points.iter().skip(1) {
            let steps = delta.x.abs() + delta.y.abs();
            let step = Coord::new(delta.x.signum(), delta.y.signum());
            for _ in 0..steps {
                cursor = Coord::new(cursor.x + step.x, cursor.y + step.y).wrapped(width, height);
                body.push(cursor);
            }
        }

        let mut snake = Snake::new(body, wire.head_direction, wire.player_id);
        snake.state = wire.state;
        snake
    }
}

/// Delta from `from` to `to`, folded onto the short way around the torus.
fn unit_delta(from: Coord, to: Coord, width: i32, height: i32) -> Coord {
    let mut dx = to.x - from.x;
    let mut dy = to.y - from.y;
    if dx > width / 2 {
        dx -= width;
    } else if dx < -(width / 2) {
        dx += width;
    }
    if dy > height / 2 {
        dy -= height;
    } else if dy < -(height / 2) {
        dy += height;
    }
    Coord::new(dx, dy)
}

fn same_axis(a: Coord, b: Coord) -> bool {
    (a.y == 0 && b.y == 0 && a.x.signum() == b.x.signum())
        || (a.x == 0 && b.x == 0 && a.y.signum() == b.y.signum())
}
