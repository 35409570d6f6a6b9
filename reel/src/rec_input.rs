use anyhow::Context;
use coupled_util::candle_data_loader::RatingTable;
use coupled_util::candle_eval::TestCase;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// MovieLens-1m age buckets, in encoding order.
const AGE_BUCKETS: [u32; 7] = [1, 18, 25, 35, 45, 50, 56];

const NUM_OCCUPATIONS: usize = 21;

/// gender (2) + age bucket (7) + occupation (21)
pub const NUM_USER_ATTRS: usize = 2 + AGE_BUCKETS.len() + NUM_OCCUPATIONS;

/// MovieLens-1m genre vocabulary, in encoding order.
const GENRES: [&str; 18] = [
    "Action",
    "Adventure",
    "Animation",
    "Children's",
    "Comedy",
    "Crime",
    "Documentary",
    "Drama",
    "Fantasy",
    "Film-Noir",
    "Horror",
    "Musical",
    "Mystery",
    "Romance",
    "Sci-Fi",
    "Thriller",
    "War",
    "Western",
];

pub const NUM_GENRES: usize = GENRES.len();

fn read_lines(path: &str) -> anyhow::Result<Vec<String>> {
    let file =
        File::open(Path::new(path)).with_context(|| format!("failed to open `{}`", path))?;
    BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read `{}`", path))
}

/// Load `users.dat` (`UserID::Gender::Age::Occupation::Zip`) into a
/// one-hot attribute matrix. Returns `(num_users, num_users x 30)`; user
/// ids index rows directly.
pub fn load_user_attributes(path: &str) -> anyhow::Result<(usize, Array2<f32>)> {
    let mut parsed = Vec::new();
    let mut max_id = 0u32;

    for (lineno, line) in read_lines(path)?.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split("::").collect();
        anyhow::ensure!(
            fields.len() >= 4,
            "{}:{}: expected `UserID::Gender::Age::Occupation::Zip`",
            path,
            lineno + 1
        );
        let uid: u32 = fields[0]
            .parse()
            .with_context(|| format!("{}:{}: bad user id", path, lineno + 1))?;
        let gender = match fields[1] {
            "F" => 0usize,
            "M" => 1usize,
            other => anyhow::bail!("{}:{}: unknown gender `{}`", path, lineno + 1, other),
        };
        let age: u32 = fields[2]
            .parse()
            .with_context(|| format!("{}:{}: bad age", path, lineno + 1))?;
        let age_bucket = AGE_BUCKETS
            .iter()
            .position(|&a| a == age)
            .ok_or_else(|| anyhow::anyhow!("{}:{}: unknown age bucket `{}`", path, lineno + 1, age))?;
        let occupation: usize = fields[3]
            .parse()
            .with_context(|| format!("{}:{}: bad occupation", path, lineno + 1))?;
        anyhow::ensure!(
            occupation < NUM_OCCUPATIONS,
            "{}:{}: occupation {} out of range",
            path,
            lineno + 1,
            occupation
        );
        max_id = max_id.max(uid);
        parsed.push((uid, gender, age_bucket, occupation));
    }
    anyhow::ensure!(!parsed.is_empty(), "no users found in `{}`", path);

    let num_users = max_id as usize + 1;
    let mut attrs = Array2::<f32>::zeros((num_users, NUM_USER_ATTRS));
    for (uid, gender, age_bucket, occupation) in parsed {
        let row = uid as usize;
        attrs[[row, gender]] = 1.0;
        attrs[[row, 2 + age_bucket]] = 1.0;
        attrs[[row, 2 + AGE_BUCKETS.len() + occupation]] = 1.0;
    }
    Ok((num_users, attrs))
}

/// Load `movies.dat` (`MovieID::Title::Genre|Genre|...`) into a genre
/// one-hot matrix. Returns `(num_items, num_items x 18)`; item ids index
/// rows directly.
pub fn load_item_genres(path: &str) -> anyhow::Result<(usize, Array2<f32>)> {
    let mut parsed = Vec::new();
    let mut max_id = 0u32;

    for (lineno, line) in read_lines(path)?.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split("::").collect();
        anyhow::ensure!(
            fields.len() >= 3,
            "{}:{}: expected `MovieID::Title::Genres`",
            path,
            lineno + 1
        );
        let mid: u32 = fields[0]
            .parse()
            .with_context(|| format!("{}:{}: bad movie id", path, lineno + 1))?;
        let mut genre_idx = Vec::new();
        for genre in fields[2].split('|') {
            let g = GENRES
                .iter()
                .position(|&known| known == genre.trim())
                .ok_or_else(|| {
                    anyhow::anyhow!("{}:{}: unknown genre `{}`", path, lineno + 1, genre)
                })?;
            genre_idx.push(g);
        }
        max_id = max_id.max(mid);
        parsed.push((mid, genre_idx));
    }
    anyhow::ensure!(!parsed.is_empty(), "no items found in `{}`", path);

    let num_items = max_id as usize + 1;
    let mut genres = Array2::<f32>::zeros((num_items, NUM_GENRES));
    for (mid, genre_idx) in parsed {
        for g in genre_idx {
            genres[[mid as usize, g]] = 1.0;
        }
    }
    Ok((num_items, genres))
}

/// Load a `train.rating` file (`user item rating timestamp`, whitespace
/// separated) into the observed-positive table. Any rating above zero
/// counts as observed.
pub fn load_rating_table(
    path: &str,
    num_users: usize,
    num_items: usize,
) -> anyhow::Result<RatingTable> {
    let mut table = RatingTable::new(num_users, num_items);

    for (lineno, line) in read_lines(path)?.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        anyhow::ensure!(
            fields.len() >= 3,
            "{}:{}: expected `user item rating [timestamp]`",
            path,
            lineno + 1
        );
        let user: u32 = fields[0]
            .parse()
            .with_context(|| format!("{}:{}: bad user id", path, lineno + 1))?;
        let item: u32 = fields[1]
            .parse()
            .with_context(|| format!("{}:{}: bad item id", path, lineno + 1))?;
        let rating: f32 = fields[2]
            .parse()
            .with_context(|| format!("{}:{}: bad rating", path, lineno + 1))?;
        if rating > 0.0 {
            table
                .insert(user, item)
                .with_context(|| format!("{}:{}", path, lineno + 1))?;
        }
    }
    Ok(table)
}

/// Load the held-out `test.rating` pairs (one per test user) and the
/// matching `test.negative` candidate lines (`(u,i)\tneg1\tneg2...`) into
/// evaluation cases. The two files must pair up line by line.
pub fn load_test_cases(
    rating_path: &str,
    negative_path: &str,
) -> anyhow::Result<Vec<TestCase>> {
    let mut pairs = Vec::new();
    for (lineno, line) in read_lines(rating_path)?.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        anyhow::ensure!(
            fields.len() >= 2,
            "{}:{}: expected `user item ...`",
            rating_path,
            lineno + 1
        );
        let user: u32 = fields[0]
            .parse()
            .with_context(|| format!("{}:{}: bad user id", rating_path, lineno + 1))?;
        let item: u32 = fields[1]
            .parse()
            .with_context(|| format!("{}:{}: bad item id", rating_path, lineno + 1))?;
        pairs.push((user, item));
    }

    let mut negatives = Vec::new();
    for (lineno, line) in read_lines(negative_path)?.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        // first field repeats the (user, item) pair; the rest are negatives
        let mut items = Vec::new();
        for field in line.split_whitespace().skip(1) {
            let item: u32 = field
                .parse()
                .with_context(|| format!("{}:{}: bad item id", negative_path, lineno + 1))?;
            items.push(item);
        }
        anyhow::ensure!(
            !items.is_empty(),
            "{}:{}: no negative candidates",
            negative_path,
            lineno + 1
        );
        negatives.push(items);
    }

    anyhow::ensure!(
        pairs.len() == negatives.len(),
        "`{}` has {} test pairs but `{}` has {} candidate lines",
        rating_path,
        pairs.len(),
        negative_path,
        negatives.len()
    );

    Ok(pairs
        .into_iter()
        .zip(negatives)
        .map(|((user, positive), negatives)| TestCase {
            user,
            positive,
            negatives,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn user_attributes_one_hot_encode() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(
            &dir,
            "users.dat",
            "1::F::1::10::48067\n2::M::56::16::70072\n",
        );

        let (num_users, attrs) = load_user_attributes(&path)?;
        assert_eq!(num_users, 3);
        assert_eq!(attrs.ncols(), NUM_USER_ATTRS);

        // user 1: female, first age bucket, occupation 10
        assert_eq!(attrs[[1, 0]], 1.0);
        assert_eq!(attrs[[1, 1]], 0.0);
        assert_eq!(attrs[[1, 2]], 1.0);
        assert_eq!(attrs[[1, 2 + 7 + 10]], 1.0);
        assert_eq!(attrs.row(1).sum(), 3.0);

        // user 2: male, last age bucket, occupation 16
        assert_eq!(attrs[[2, 1]], 1.0);
        assert_eq!(attrs[[2, 2 + 6]], 1.0);
        assert_eq!(attrs[[2, 2 + 7 + 16]], 1.0);

        // id 0 never appears: all-zero row
        assert_eq!(attrs.row(0).sum(), 0.0);
        Ok(())
    }

    #[test]
    fn unknown_gender_or_age_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bad_gender = write_file(&dir, "g.dat", "1::X::1::10::48067\n");
        assert!(load_user_attributes(&bad_gender).is_err());

        let bad_age = write_file(&dir, "a.dat", "1::F::19::10::48067\n");
        assert!(load_user_attributes(&bad_age).is_err());

        let bad_occupation = write_file(&dir, "o.dat", "1::F::1::21::48067\n");
        assert!(load_user_attributes(&bad_occupation).is_err());
    }

    #[test]
    fn item_genres_one_hot_encode() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(
            &dir,
            "movies.dat",
            "1::Toy Story (1995)::Animation|Children's|Comedy\n\
             2::Jumanji (1995)::Adventure|Children's|Fantasy\n",
        );

        let (num_items, genres) = load_item_genres(&path)?;
        assert_eq!(num_items, 3);
        assert_eq!(genres.ncols(), NUM_GENRES);
        assert_eq!(genres[[1, 2]], 1.0); // Animation
        assert_eq!(genres[[1, 3]], 1.0); // Children's
        assert_eq!(genres[[1, 4]], 1.0); // Comedy
        assert_eq!(genres.row(1).sum(), 3.0);
        assert_eq!(genres.row(2).sum(), 3.0);

        let bad = write_file(&dir, "bad.dat", "1::Title::Cooking\n");
        assert!(load_item_genres(&bad).is_err());
        Ok(())
    }

    #[test]
    fn rating_table_keeps_positive_ratings_only() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(
            &dir,
            "train.rating",
            "0\t1\t5\t978300760\n1\t2\t0\t978300761\n2\t0\t3\t978300762\n",
        );

        let table = load_rating_table(&path, 3, 3)?;
        assert_eq!(table.len(), 2);
        assert!(table.contains(0, 1));
        assert!(!table.contains(1, 2)); // zero rating
        assert!(table.contains(2, 0));
        Ok(())
    }

    #[test]
    fn test_cases_pair_ratings_with_negatives() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ratings = write_file(&dir, "test.rating", "0\t3\t5\t978\n1\t2\t4\t978\n");
        let negatives = write_file(&dir, "test.negative", "(0,3)\t1\t2\n(1,2)\t0\t3\n");

        let cases = load_test_cases(&ratings, &negatives)?;
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].user, 0);
        assert_eq!(cases[0].positive, 3);
        assert_eq!(cases[0].negatives, vec![1, 2]);
        assert_eq!(cases[1].user, 1);
        assert_eq!(cases[1].negatives, vec![0, 3]);

        let short = write_file(&dir, "short.negative", "(0,3)\t1\t2\n");
        assert!(load_test_cases(&ratings, &short).is_err());
        Ok(())
    }
}
