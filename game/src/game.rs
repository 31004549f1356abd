//! The authoritative simulation tick.

use crate::field::Field;
use crate::snake::MoveOutcome;
use crate::GameError;
use log::{debug, warn};
use rand::Rng;
use shared::{Coord, Direction, GameConfig, SnakeState};
use std::collections::HashSet;

/// One game session's simulation.
///
/// The master drives it through [`Game::tick`]; replicas only feed it
/// snapshots through the field. All methods assume the caller holds the
/// session's game lock — the struct itself is single-threaded by design.
#[derive(Debug, Clone)]
pub struct Game {
    field: Field,
}

impl Game {
    pub fn new(config: GameConfig) -> Self {
        Game {
            field: Field::new(config),
        }
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn field_mut(&mut self) -> &mut Field {
        &mut self.field
    }

    /// Advances the board by one tick: replenish food, move every snake,
    /// resolve eating, then resolve inter-snake collisions on the post-move
    /// board. Remote observers only ever see the state after a full tick.
    pub fn tick(&mut self) {
        self.replenish_food();
        self.move_snakes();
        self.resolve_collisions();
    }

    fn replenish_food(&mut self) {
        let target = self.field.food_target(self.field.snakes().len());
        while self.field.foods().len() < target {
            if !self.field.has_place() {
                warn!("no room left to place food");
                break;
            }
            if !self.place_food() {
                break;
            }
        }
    }

    /// Samples random cells until a free one is found, bounded by the cell
    /// count of the board. Returns false when no free cell turned up.
    fn place_food(&mut self) -> bool {
        let mut rng = rand::thread_rng();
        let attempts = self.field.width() * self.field.height();
        for _ in 0..attempts {
            let cell = Coord::new(
                rng.gen_range(0..self.field.width()),
                rng.gen_range(0..self.field.height()),
            );
            if !self.field.is_cell_occupied(cell) {
                self.field.add_food(cell);
                return true;
            }
        }
        false
    }

    fn move_snakes(&mut self) {
        let width = self.field.width();
        let height = self.field.height();

        let ids: Vec<i32> = self.field.snakes().iter().map(|s| s.player_id()).collect();
        let mut dead = Vec::new();

        for id in ids {
            let Some(snake) = self.field.snake_by_id_mut(id) else {
                continue;
            };
            if snake.advance(width, height) == MoveOutcome::Died {
                dead.push(id);
                continue;
            }
            let head = snake.head();
            if self.field.contains_food(head) {
                self.field.remove_food(head);
                if let Some(snake) = self.field.snake_by_id_mut(id) {
                    snake.add_score(1);
                }
            } else if let Some(snake) = self.field.snake_by_id_mut(id) {
                snake.shrink();
            }
        }

        for id in dead {
            self.field.remove_snake(id);
        }
    }

    /// Post-move resolution: equal heads kill both snakes and score neither;
    /// a head inside another snake's body kills the impactor and credits the
    /// victim. Removals are deduplicated by player id.
    fn resolve_collisions(&mut self) {
        let snapshot: Vec<(i32, Coord, Vec<Coord>)> = self
            .field
            .snakes()
            .iter()
            .map(|s| (s.player_id(), s.head(), s.body().to_vec()))
            .collect();

        let mut killed: HashSet<i32> = HashSet::new();
        let mut credited: Vec<i32> = Vec::new();

        for (id, head, _) in &snapshot {
            for (other_id, other_head, other_body) in &snapshot {
                if id == other_id {
                    continue;
                }
                if head == other_head {
                    killed.insert(*id);
                    killed.insert(*other_id);
                } else if other_body[1..].contains(head) {
                    killed.insert(*id);
                    credited.push(*other_id);
                }
            }
        }

        for id in credited {
            if let Some(snake) = self.field.snake_by_id_mut(id) {
                snake.add_score(1);
            }
        }
        for id in killed {
            self.field.remove_snake(id);
        }
    }

    /// Queues a steering request for the player's snake. Requests for a
    /// zombie snake are ignored — its owner is gone.
    pub fn steer(&mut self, player_id: i32, direction: Direction) {
        match self.field.snake_by_id_mut(player_id) {
            Some(snake) if snake.state() == SnakeState::Zombie => {
                debug!("ignoring steer for zombie snake of player {}", player_id)
            }
            Some(snake) => snake.enqueue_direction(direction),
            None => debug!("steer for unknown player {}", player_id),
        }
    }

    /// Spawns a snake for a newly joined player.
    pub fn add_snake(&mut self, player_id: i32) -> Result<(), GameError> {
        self.field.add_new_snake(player_id)
    }

    /// Removes the player's snake immediately, converting segments to food.
    pub fn remove_snake(&mut self, player_id: i32) {
        self.field.remove_snake(player_id);
    }

    /// Detaches the snake from its departed owner; it keeps crawling in its
    /// last direction until it dies.
    pub fn zombify(&mut self, player_id: i32) {
        if let Some(snake) = self.field.snake_by_id_mut(player_id) {
            snake.set_state(SnakeState::Zombie);
        }
    }

    pub fn score_of(&self, player_id: i32) -> Option<i32> {
        self.field.snake_by_id(player_id).map(|s| s.score())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snake::Snake;

    fn config(width: i32, height: i32) -> GameConfig {
        GameConfig {
            width,
            height,
            food_static: 1,
            state_delay_ms: 100,
        }
    }

    fn inject(game: &mut Game, cells: &[(i32, i32)], facing: Direction, player_id: i32) {
        let body = cells.iter().map(|&(x, y)| Coord::new(x, y)).collect();
        game.field_mut().add_snake(Snake::new(body, facing, player_id));
    }

    #[test]
    fn solo_tick_keeps_length_and_feeds_the_board() {
        let mut game = Game::new(config(10, 10));
        game.add_snake(1).unwrap();

        for _ in 0..10 {
            game.tick();
        }

        let snake = game.field().snake_by_id(1).expect("snake survives alone");
        // One food per snake plus the static baseline, minus at most one
        // eaten since the last replenish.
        assert!((1..=2).contains(&game.field().foods().len()));
        // Length grows exactly with the score.
        assert_eq!(snake.len() as i32, 2 + snake.score());
    }

    #[test]
    fn eating_grows_the_snake_and_scores() {
        let mut game = Game::new(GameConfig {
            food_static: 0,
            ..config(10, 10)
        });
        inject(&mut game, &[(5, 5), (4, 5)], Direction::Right, 1);
        game.field_mut().add_food(Coord::new(6, 5));

        game.tick();

        let snake = game.field().snake_by_id(1).unwrap();
        assert_eq!(snake.score(), 1);
        assert_eq!(snake.len(), 3);
        assert_eq!(snake.head(), Coord::new(6, 5));
        assert!(!game.field().contains_food(Coord::new(6, 5)));
    }

    #[test]
    fn head_on_collision_kills_both_and_scores_neither() {
        let mut game = Game::new(GameConfig {
            food_static: 0,
            ..config(10, 4)
        });
        inject(&mut game, &[(2, 1), (1, 1)], Direction::Right, 1);
        inject(&mut game, &[(4, 1), (5, 1)], Direction::Left, 2);

        game.tick();

        // Both heads landed on (3, 1).
        assert!(game.field().snake_by_id(1).is_none());
        assert!(game.field().snake_by_id(2).is_none());
    }

    #[test]
    fn body_impact_kills_the_impactor_and_credits_the_victim() {
        let mut game = Game::new(GameConfig {
            food_static: 0,
            ..config(10, 10)
        });
        inject(
            &mut game,
            &[(6, 2), (5, 2), (4, 2), (3, 2), (2, 2)],
            Direction::Right,
            1,
        );
        inject(&mut game, &[(4, 1), (4, 0)], Direction::Down, 2);
        // Pin the replenish target away from both paths so the victim's
        // score comes from the collision alone.
        game.field_mut().add_food(Coord::new(0, 9));
        game.field_mut().add_food(Coord::new(9, 9));

        game.tick();

        // Snake 2's head stepped onto (4, 2), inside snake 1's body.
        assert!(game.field().snake_by_id(2).is_none());
        let victim = game.field().snake_by_id(1).unwrap();
        assert_eq!(victim.score(), 1);
    }

    #[test]
    fn board_invariants_hold_across_many_ticks() {
        let mut game = Game::new(config(12, 9));
        for id in 0..3 {
            game.add_snake(id).unwrap();
        }

        for _ in 0..50 {
            game.tick();

            let field = game.field();
            let mut seen = HashSet::new();
            for snake in field.snakes() {
                for segment in snake.body() {
                    // Torus closure.
                    assert!(segment.x >= 0 && segment.x < 12);
                    assert!(segment.y >= 0 && segment.y < 9);
                    // No snake overlaps itself at a tick boundary (each
                    // snake's cells are tracked per snake).
                }
                let body: HashSet<_> = snake.body().iter().collect();
                assert_eq!(body.len(), snake.len(), "self-overlap in snake body");
            }
            for food in field.foods() {
                assert!(
                    seen.insert(*food),
                    "duplicate food cell {:?} on the board",
                    food
                );
                for snake in field.snakes() {
                    assert!(
                        !snake.body_contains(*food),
                        "food {:?} overlaps a snake",
                        food
                    );
                }
            }
        }
    }

    #[test]
    fn steering_a_zombie_is_ignored() {
        let mut game = Game::new(config(10, 10));
        inject(&mut game, &[(5, 5), (4, 5)], Direction::Right, 1);
        game.zombify(1);
        game.steer(1, Direction::Up);

        game.tick();

        // Still moving straight in its last direction.
        let snake = game.field().snake_by_id(1).unwrap();
        assert_eq!(snake.head(), Coord::new(6, 5));
        assert_eq!(snake.head_direction(), Direction::Right);
        assert_eq!(snake.state(), SnakeState::Zombie);
    }

    #[test]
    fn consecutive_headings_are_never_opposite() {
        let mut game = Game::new(config(10, 10));
        inject(&mut game, &[(5, 5), (4, 5)], Direction::Right, 1);

        let mut previous = Direction::Right;
        let steers = [
            Direction::Left,
            Direction::Up,
            Direction::Down,
            Direction::Right,
            Direction::Left,
            Direction::Up,
        ];
        for steer in steers {
            game.steer(1, steer);
            game.tick();
            let Some(snake) = game.field().snake_by_id(1) else {
                break;
            };
            assert_ne!(snake.head_direction(), previous.opposite());
            previous = snake.head_direction();
        }
    }
}
