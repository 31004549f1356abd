//! The toroidal grid holding snakes and food, plus spawn placement and
//! replica state ingestion.

use crate::snake::Snake;
use crate::GameError;
use log::{debug, warn};
use rand::Rng;
use shared::{Coord, Direction, GameConfig, GameStateMsg, SPAWN_ATTEMPTS, SPAWN_CLEARANCE};

/// The playing field of one game session.
///
/// Owns every snake and every food cell. On the master this is the
/// authoritative board mutated by the tick; on a replica it is a passive
/// mirror overwritten by [`Field::apply_state`].
#[derive(Debug, Clone)]
pub struct Field {
    config: GameConfig,
    snakes: Vec<Snake>,
    foods: Vec<Coord>,
}

impl Field {
    pub fn new(config: GameConfig) -> Self {
        Field {
            config,
            snakes: Vec::new(),
            foods: Vec::new(),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn width(&self) -> i32 {
        self.config.width
    }

    pub fn height(&self) -> i32 {
        self.config.height
    }

    pub fn food_static(&self) -> i32 {
        self.config.food_static
    }

    /// Food the field should hold for the given number of living snakes.
    pub fn food_target(&self, snake_count: usize) -> usize {
        snake_count + self.config.food_static.max(0) as usize
    }

    /// True iff any snake segment or food occupies the cell.
    pub fn is_cell_occupied(&self, cell: Coord) -> bool {
        self.foods.contains(&cell) || self.snakes.iter().any(|s| s.body_contains(cell))
    }

    pub fn contains_food(&self, cell: Coord) -> bool {
        self.foods.contains(&cell)
    }

    /// True while at least one cell stays free, so a tick can always move.
    pub fn has_place(&self) -> bool {
        let occupied: usize =
            self.foods.len() + self.snakes.iter().map(|s| s.len()).sum::<usize>();
        occupied < (self.width() as usize * self.height() as usize) - 1
    }

    /// Searches for a spawn clearing: a random center whose 5x5 toroidal
    /// neighborhood is free of snakes and food, with a uniformly random
    /// facing. The tail goes one cell behind the head so the first move
    /// steps away from it.
    ///
    /// Fails with [`GameError::NoSpace`] after [`SPAWN_ATTEMPTS`] tries.
    pub fn find_spawn(&self) -> Result<(Vec<Coord>, Direction), GameError> {
        let mut rng = rand::thread_rng();

        for _ in 0..SPAWN_ATTEMPTS {
            let center = Coord::new(
                rng.gen_range(0..self.width()),
                rng.gen_range(0..self.height()),
            );

            let half = SPAWN_CLEARANCE / 2;
            let clear = (-half..=half).all(|dx| {
                (-half..=half).all(|dy| {
                    let cell =
                        Coord::new(center.x + dx, center.y + dy).wrapped(self.width(), self.height());
                    !self.is_cell_occupied(cell)
                })
            });
            if !clear {
                continue;
            }

            let facing = Direction::ALL[rng.gen_range(0..Direction::ALL.len())];
            let (dx, dy) = facing.opposite().offset();
            let tail = Coord::new(center.x + dx, center.y + dy).wrapped(self.width(), self.height());
            return Ok((vec![center, tail], facing));
        }

        Err(GameError::NoSpace)
    }

    /// Spawns a two-segment snake for the player, if the board has room.
    pub fn add_new_snake(&mut self, player_id: i32) -> Result<(), GameError> {
        let (body, facing) = self.find_spawn()?;
        self.snakes.push(Snake::new(body, facing, player_id));
        Ok(())
    }

    pub fn add_snake(&mut self, snake: Snake) {
        self.snakes.push(snake);
    }

    /// Removes the player's snake, converting each non-head segment to food
    /// with probability one half. Segments already holding food or another
    /// snake's body are skipped so food never overlaps a living snake.
    pub fn remove_snake(&mut self, player_id: i32) {
        let Some(index) = self.snakes.iter().position(|s| s.player_id() == player_id) else {
            debug!("no snake to remove for player {}", player_id);
            return;
        };
        let snake = self.snakes.remove(index);

        let mut rng = rand::thread_rng();
        for segment in snake.body().iter().skip(1) {
            if !rng.gen_bool(0.5) {
                continue;
            }
            if self.foods.contains(segment)
                || self.snakes.iter().any(|s| s.body_contains(*segment))
            {
                continue;
            }
            self.foods.push(*segment);
        }
    }

    pub fn add_food(&mut self, cell: Coord) {
        self.foods.push(cell);
    }

    pub fn remove_food(&mut self, cell: Coord) {
        self.foods.retain(|food| *food != cell);
    }

    pub fn set_foods(&mut self, foods: Vec<Coord>) {
        self.foods = foods;
    }

    pub fn foods(&self) -> &[Coord] {
        &self.foods
    }

    pub fn snakes(&self) -> &[Snake] {
        &self.snakes
    }

    pub fn snakes_mut(&mut self) -> &mut [Snake] {
        &mut self.snakes
    }

    pub fn snake_by_id(&self, player_id: i32) -> Option<&Snake> {
        self.snakes.iter().find(|s| s.player_id() == player_id)
    }

    pub fn snake_by_id_mut(&mut self, player_id: i32) -> Option<&mut Snake> {
        self.snakes.iter_mut().find(|s| s.player_id() == player_id)
    }

    /// Overwrites the board from a received snapshot (replica path).
    ///
    /// Foods are replaced wholesale. Snakes are matched by player id:
    /// existing ones get their body and heading rewritten, new ones are
    /// decoded from the wire, and any snake missing from the snapshot is
    /// dropped. Scores are copied from the snapshot roster.
    pub fn apply_state(&mut self, state: &GameStateMsg) {
        self.foods = state.foods.clone();

        for snake in &mut self.snakes {
            snake.set_updated(false);
        }

        for wire in &state.snakes {
            let decoded = Snake::from_wire(wire, self.config.width, self.config.height);
            match self.snake_by_id_mut(wire.player_id) {
                Some(existing) => {
                    existing.overwrite(
                        decoded.body().to_vec(),
                        decoded.head_direction(),
                        decoded.state(),
                    );
                    existing.set_updated(true);
                }
                None => {
                    let mut decoded = decoded;
                    decoded.set_updated(true);
                    self.snakes.push(decoded);
                }
            }
        }

        self.snakes.retain(|snake| {
            if !snake.is_updated() {
                warn!("snake of player {} vanished from snapshot", snake.player_id());
            }
            snake.is_updated()
        });

        for player in &state.players {
            if let Some(snake) = self.snake_by_id_mut(player.id) {
                snake.set_score(player.score);
            }
        }
    }
}
